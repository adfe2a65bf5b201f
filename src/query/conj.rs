//! Deterministic store keys for conjunctions and schemes.

use super::dnf::Conjunction;

/// Renders a conjunction as `a=1&b=2` with fields in lexicographic order.
///
/// `%`, `&` and `=` inside values are percent-escaped so the form parses back
/// unambiguously. The empty conjunction renders as the empty string.
pub fn canonical(conj: &Conjunction) -> String {
    conj.iter()
        .map(|(field, value)| format!("{}={}", escape(field), escape(&value.to_string())))
        .collect::<Vec<_>>()
        .join("&")
}

/// Inverse of [`canonical`]: field and rendered value pairs in key order.
pub fn parse_canonical(canonical: &str) -> Vec<(String, String)> {
    if canonical.is_empty() {
        return Vec::new();
    }
    canonical
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((field, value)) => (unescape(field), unescape(value)),
            None => (unescape(pair), String::new()),
        })
        .collect()
}

/// `{prefix}conj:{table}:{canonical}`.
pub fn conj_key(prefix: &str, table: &str, conj: &Conjunction) -> String {
    conj_key_from_canonical(prefix, table, &canonical(conj))
}

pub fn conj_key_from_canonical(prefix: &str, table: &str, canonical: &str) -> String {
    format!("{prefix}conj:{table}:{canonical}")
}

/// Glob matching every conjunction key of a table.
pub fn conj_pattern(prefix: &str, table: &str) -> String {
    format!("{prefix}conj:{table}:*")
}

/// Glob matching every conjunction key under a prefix.
pub fn all_conj_pattern(prefix: &str) -> String {
    format!("{prefix}conj:*")
}

/// The field shape of a conjunction: sorted field names joined by `,`.
pub fn scheme(conj: &Conjunction) -> String {
    conj.keys().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Field names of a scheme string; the empty scheme has none.
pub fn scheme_fields(scheme: &str) -> Vec<&str> {
    if scheme.is_empty() {
        Vec::new()
    } else {
        scheme.split(',').collect()
    }
}

/// `{prefix}schemes:{table}`.
pub fn scheme_key(prefix: &str, table: &str) -> String {
    format!("{prefix}schemes:{table}")
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = match tail.get(..3) {
            Some("%25") => Some('%'),
            Some("%26") => Some('&'),
            Some("%3D") => Some('='),
            _ => None,
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use crate::query::predicate::Value;

    use super::*;

    fn conj<const N: usize>(pairs: [(&str, Value); N]) -> Conjunction {
        pairs
            .into_iter()
            .map(|(field, value)| (field.to_string(), value))
            .collect()
    }

    #[test]
    fn canonical_sorts_fields() {
        let c = conj([("b", Value::Int(2)), ("a", Value::Int(1))]);
        assert_eq!(canonical(&c), "a=1&b=2");
        assert_eq!(
            parse_canonical("a=1&b=2"),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn empty_conjunction_has_empty_canonical_form() {
        assert_eq!(canonical(&Conjunction::new()), "");
        assert!(parse_canonical("").is_empty());
        insta::assert_snapshot!(conj_key("", "post", &Conjunction::new()), @"conj:post:");
    }

    #[test]
    fn awkward_values_round_trip() {
        let c = conj([("q", Value::from("a=b&c%d")), ("n", Value::Null)]);
        let rendered = canonical(&c);
        assert_eq!(rendered, "n=null&q=a%3Db%26c%25d");
        assert_eq!(
            parse_canonical(&rendered),
            vec![
                ("n".to_string(), "null".to_string()),
                ("q".to_string(), "a=b&c%d".to_string())
            ]
        );
    }

    #[test]
    fn keys_and_schemes() {
        let c = conj([("status", Value::from("draft")), ("author_id", Value::Int(9))]);
        insta::assert_snapshot!(
            conj_key("{db1}:", "post", &c),
            @"{db1}:conj:post:author_id=9&status=draft"
        );
        assert_eq!(scheme(&c), "author_id,status");
        assert_eq!(scheme_fields("author_id,status"), vec!["author_id", "status"]);
        assert!(scheme_fields("").is_empty());
        assert_eq!(scheme_key("p:", "post"), "p:schemes:post");
        assert_eq!(conj_pattern("p:", "post"), "p:conj:post:*");
    }
}
