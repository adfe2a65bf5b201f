use granule::cache::registrations;
use granule::query::{Leaf, Predicate, Query, TranslateOptions, translate};
use insta::assert_snapshot;

fn render(query: &Query, prefix: &str) -> String {
    let dnf = translate(query, &TranslateOptions::default()).expect("translation should succeed");
    registrations(prefix, &dnf)
        .into_iter()
        .map(|reg| format!("{} [{}] {}", reg.conj_key, reg.scheme_key, reg.scheme))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn join_registrations() {
    let query = Query::table("blog.post")
        .join("author", "auth.user")
        .filter(Predicate::And(vec![
            Leaf::exact("blog.post", "status", "published").into(),
            Leaf::one_of("author", "id", [1_i64, 2]).into(),
        ]));

    assert_snapshot!(render(&query, ""), @r"
    conj:auth.user:id=1 [schemes:auth.user] id
    conj:auth.user:id=2 [schemes:auth.user] id
    conj:blog.post:status=published [schemes:blog.post] status
    ");
}

#[test]
fn union_and_escaped_values() {
    let query = Query::table("blog.post")
        .filter(Predicate::And(vec![
            Leaf::exact("blog.post", "author_id", 3).into(),
            Leaf::exact("blog.post", "title", "a&b=c").into(),
        ]))
        .union(Query::table("blog.tag").filter(Leaf::is_null("blog.tag", "parent_id", true)));

    assert_snapshot!(render(&query, "shard1:"), @r"
    shard1:conj:blog.post:author_id=3&title=a%26b%3Dc [shard1:schemes:blog.post] author_id,title
    shard1:conj:blog.tag:parent_id=null [shard1:schemes:blog.tag] parent_id
    ");
}
