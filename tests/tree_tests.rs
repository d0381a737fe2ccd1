//! End-to-end tests for the shared directory tree.
//!
//! Every test attaches to a uniquely named arena so parallel test threads
//! (and other test binaries) never collide.

use canopy::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

fn uniq(tag: &str) -> String {
    static N: AtomicU32 = AtomicU32::new(0);
    format!(
        "canopy-tree-{}-{}-{}",
        std::process::id(),
        tag,
        N.fetch_add(1, Ordering::Relaxed)
    )
}

fn attach(tag: &str) -> TreeContainer<ShmString> {
    TreeContainer::new(&uniq(tag), 64 * 1024).expect("attach")
}

fn payload(node: &NodeRef<ShmString>) -> String {
    node.data().as_str(node.arena()).to_string()
}

/// Recursively check the structural invariants below `node` and return the
/// subtree's node count.
fn check_invariants(node: &NodeRef<ShmString>) -> usize {
    let mut total = 1;
    for child in node.children() {
        // Parent back-reference and case-insensitive slot agree.
        assert_eq!(child.parent().expect("child has a parent"), *node);
        assert_eq!(
            node.child_by_name(&child.name().to_uppercase())
                .expect("child findable under case folding"),
            child
        );
        // Dummy implies directory.
        if child.has_flag(FLAG_DUMMY) {
            assert!(child.has_flag(FLAG_DIRECTORY));
        }
        // Path round-trips from the root.
        total += check_invariants(&child);
    }
    assert_eq!(node.num_nodes_recursive(), total);
    total
}

// ============================================================================
// Scenario tests
// ============================================================================

#[test]
fn test_empty_tree() {
    let mut tree = attach("empty");
    assert!(tree.name().ends_with("_1"));
    let root = tree.root().unwrap();
    assert_eq!(root.num_children(), 0);
    assert_eq!(root.num_nodes_recursive(), 1);
    assert_eq!(root.path(), "/");
    assert!(root.is_directory());
    assert_eq!(root.name(), "");
}

#[test]
fn test_nested_insert_creates_dummies() {
    let mut tree = attach("nested");
    let node = tree
        .add_file("a/b/c.txt", "X", 0, true)
        .unwrap()
        .expect("inserted");

    let a = tree.find_by_path("a").unwrap().expect("a exists");
    assert_eq!(a.flags(), FLAG_DIRECTORY | FLAG_DUMMY);
    let b = tree.find_by_path("a/b").unwrap().expect("a/b exists");
    assert_eq!(b.flags(), FLAG_DIRECTORY | FLAG_DUMMY);

    let c = tree.find_by_path("a/b/c.txt").unwrap().expect("leaf exists");
    assert_eq!(c.flags(), 0);
    assert_eq!(payload(&c), "X");
    assert_eq!(c, node);
    assert_eq!(c.path(), "/a/b/c.txt");

    // Path round-trip through the root.
    let root = tree.root().unwrap();
    assert_eq!(root.find_by_path(&c.path()).expect("round-trip"), c);
    check_invariants(&root);
}

#[test]
fn test_case_insensitive_lookup() {
    let mut tree = attach("case");
    tree.add_file("Foo/Bar", "v", 0, true).unwrap();

    let lower = tree.find_by_path("foo/bar").unwrap().expect("lower");
    let upper = tree.find_by_path("FOO/BAR").unwrap().expect("upper");
    let mixed = tree.find_by_path("fOo\\bAr").unwrap().expect("mixed");
    assert_eq!(lower, upper);
    assert_eq!(lower, mixed);
    // The stored name keeps its original case.
    assert_eq!(lower.name(), "Bar");
}

#[test]
fn test_glob_find() {
    let mut tree = attach("glob");
    tree.add_file("a/b/c1.txt", "1", 0, true).unwrap();
    tree.add_file("a/b/c2.txt", "2", 0, true).unwrap();
    tree.add_file("a/d/e.txt", "3", 0, true).unwrap();

    let hits = tree.find("a/b/*.txt").unwrap();
    let names: Vec<_> = hits.iter().map(|n| n.name()).collect();
    assert_eq!(names, ["c1.txt", "c2.txt"]);

    // `*` before a separator matches exactly one directory level.
    let hits = tree.find("a/*/e.txt").unwrap();
    let paths: Vec<_> = hits.iter().map(|n| n.path()).collect();
    assert_eq!(paths, ["/a/d/e.txt"]);

    // `?` matches a single byte.
    let hits = tree.find("a/b/c?.txt").unwrap();
    assert_eq!(hits.len(), 2);

    // Case folding applies to patterns too.
    let hits = tree.find("A/B/*.TXT").unwrap();
    assert_eq!(hits.len(), 2);

    // A literal pattern finds exactly its node.
    let hits = tree.find("a/d/e.txt").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path(), "/a/d/e.txt");

    // No matches is an empty result, not an error.
    assert!(tree.find("a/b/*.dds").unwrap().is_empty());
}

#[test]
fn test_trailing_star_covers_subtree() {
    let mut tree = attach("star");
    tree.add_file("mods/tex/rock.dds", "r", 0, true).unwrap();
    tree.add_file("mods/tex/moss.dds", "m", 0, true).unwrap();
    tree.add_file("mods/readme.txt", "t", 0, true).unwrap();

    let hits = tree.find("mods/*").unwrap();
    let names: Vec<_> = hits.iter().map(|n| n.name()).collect();
    // Sorted map order, subtrees inline after their directory.
    assert_eq!(names, ["readme.txt", "tex", "moss.dds", "rock.dds"]);
}

#[test]
fn test_overwrite_and_no_overwrite() {
    let mut tree = attach("overwrite");

    let first = tree.add_file("f", "X", 0, false).unwrap();
    assert!(first.is_some());

    // Second insert without overwrite: untouched, signalled by None.
    let second = tree.add_file("f", "Y", 0, false).unwrap();
    assert!(second.is_none());
    let node = tree.find_by_path("f").unwrap().unwrap();
    assert_eq!(payload(&node), "X");

    // With overwrite the new payload wins.
    let third = tree.add_file("f", "Y", 0, true).unwrap();
    assert!(third.is_some());
    let node = tree.find_by_path("f").unwrap().unwrap();
    assert_eq!(payload(&node), "Y");
}

// ============================================================================
// Mutation semantics
// ============================================================================

#[test]
fn test_repeated_overwrite_is_idempotent() {
    let mut tree = attach("idem");
    for _ in 0..5 {
        tree.add_file("p/q/r", "data", 0, true).unwrap();
    }
    let root = tree.root().unwrap();
    assert_eq!(root.num_nodes_recursive(), 4);
    assert_eq!(payload(&tree.find_by_path("p/q/r").unwrap().unwrap()), "data");
    check_invariants(&root);
}

#[test]
fn test_directory_upgrade_preserves_children() {
    let mut tree = attach("upgrade");
    tree.add_file("a/b/c.txt", "X", 0, true).unwrap();

    // Explicitly inserting the dummy directory upgrades it in place.
    let a = tree
        .add_directory("a", "D:/real/a", 0, true)
        .unwrap()
        .expect("upgraded");
    assert!(a.is_directory());
    assert!(!a.has_flag(FLAG_DUMMY));
    assert_eq!(payload(&a), "D:/real/a");

    // The subtree survived the upgrade.
    let c = tree.find_by_path("a/b/c.txt").unwrap().expect("still there");
    assert_eq!(payload(&c), "X");
}

#[test]
fn test_no_overwrite_leaves_dummy_alone() {
    let mut tree = attach("dummy-noop");
    tree.add_file("a/b", "X", 0, true).unwrap();
    let result = tree.add_directory("a", "real", 0, false).unwrap();
    assert!(result.is_none());
    let a = tree.find_by_path("a").unwrap().unwrap();
    assert_eq!(a.flags(), FLAG_DIRECTORY | FLAG_DUMMY);
}

#[test]
fn test_file_overwrite_replaces_subtree() {
    let mut tree = attach("replace");
    tree.add_file("a/b", "X", 0, true).unwrap();

    // A file insert over the dummy directory replaces it wholesale.
    tree.add_file("a", "flat", 0, true).unwrap();
    let a = tree.find_by_path("a").unwrap().unwrap();
    assert_eq!(a.flags(), 0);
    assert_eq!(payload(&a), "flat");
    assert!(tree.find_by_path("a/b").unwrap().is_none());
    assert_eq!(tree.root().unwrap().num_nodes_recursive(), 2);
}

#[test]
fn test_overwritten_node_survives_through_handle() {
    let mut tree = attach("survivor");
    let old = tree.add_file("f", "old", 0, true).unwrap().unwrap();
    tree.add_file("f", "new", 0, true).unwrap();

    // The held handle still reads the detached node.
    assert_eq!(payload(&old), "old");
    assert!(old.parent().is_none());

    // The tree sees only the replacement.
    assert_eq!(payload(&tree.find_by_path("f").unwrap().unwrap()), "new");
}

#[test]
fn test_remove_child_and_clear() {
    let mut tree = attach("remove");
    tree.add_file("a/b/c", "1", 0, true).unwrap();
    tree.add_file("a/x", "2", 0, true).unwrap();

    let a = tree.find_by_path("a").unwrap().unwrap();
    assert!(a.remove_child("B"));
    assert!(!a.remove_child("B"));
    assert!(tree.find_by_path("a/b/c").unwrap().is_none());
    assert!(tree.find_by_path("a/x").unwrap().is_some());

    tree.clear().unwrap();
    let root = tree.root().unwrap();
    assert_eq!(root.num_children(), 0);
    assert_eq!(root.num_nodes_recursive(), 1);

    // The tree is still usable after a clear.
    tree.add_file("fresh", "f", 0, true).unwrap();
    assert!(tree.find_by_path("fresh").unwrap().is_some());
}

#[test]
fn test_empty_path_inserts_nothing() {
    let mut tree = attach("empty-path");
    assert!(tree.add_file("", "x", 0, true).unwrap().is_none());
    assert!(tree.add_file("///", "x", 0, true).unwrap().is_none());
    assert_eq!(tree.root().unwrap().num_nodes_recursive(), 1);
}

// ============================================================================
// Node operations
// ============================================================================

#[test]
fn test_children_iterate_sorted() {
    let mut tree = attach("sorted");
    tree.add_file("Zebra", "1", 0, true).unwrap();
    tree.add_file("apple", "2", 0, true).unwrap();
    tree.add_file("Mango", "3", 0, true).unwrap();

    let root = tree.root().unwrap();
    let names: Vec<_> = root.children().map(|c| c.name()).collect();
    assert_eq!(names, ["apple", "Mango", "Zebra"]);
    assert_eq!(root.num_children(), 3);
}

#[test]
fn test_child_lookup_variants() {
    let mut tree = attach("lookup");
    tree.add_file("dir/file", "v", 0, true).unwrap();
    let root = tree.root().unwrap();

    assert!(root.exists("DIR"));
    assert!(!root.exists("other"));
    assert!(root.child_by_name("dir").is_some());
    assert!(root.child_by_name("other").is_none());
    assert!(root.child_by_name_required("dir").is_ok());
    match root.child_by_name_required("other") {
        Err(Error::NodeMissing(name)) => assert_eq!(name, "other"),
        other => panic!("expected NodeMissing, got {other:?}"),
    }
}

#[test]
fn test_visit_path_stops_at_first_miss() {
    let mut tree = attach("visit");
    tree.add_file("a/b/c", "v", 0, true).unwrap();

    let mut seen = Vec::new();
    tree.visit_path("a/b/missing/deeper", |node| seen.push(node.name()))
        .unwrap();
    assert_eq!(seen, ["a", "b"]);

    seen.clear();
    tree.visit_path("A\\B\\C", |node| seen.push(node.name()))
        .unwrap();
    assert_eq!(seen, ["a", "b", "c"]);
}

#[test]
fn test_user_flags() {
    let mut tree = attach("flags");
    let node = tree
        .add_file("f", "v", FLAG_FIRST_USER, true)
        .unwrap()
        .unwrap();
    assert!(node.has_flag(FLAG_FIRST_USER));
    node.set_flag(FLAG_FIRST_USER, false);
    assert!(!node.has_flag(FLAG_FIRST_USER));
    node.set_flag(FLAG_FIRST_USER << 1, true);
    assert!(node.has_flag(FLAG_FIRST_USER << 1));
}

#[test]
fn test_find_by_path_identity_and_empty() {
    let mut tree = attach("identity");
    tree.add_file("a/b", "v", 0, true).unwrap();
    let root = tree.root().unwrap();

    // Empty paths resolve to the node itself.
    assert_eq!(root.find_by_path("").unwrap(), root);
    assert_eq!(root.find_by_path("/").unwrap(), root);

    // Relative descent from an interior node.
    let a = root.find_by_path("a").unwrap();
    let b = a.find_by_path("b").unwrap();
    assert_eq!(b.path(), "/a/b");
}

#[test]
fn test_dump_renders_tree() {
    let mut tree = attach("dump");
    tree.add_file("a/b.txt", "v", 0, true).unwrap();
    let mut out = String::new();
    tree.root().unwrap().dump(&mut out).unwrap();
    assert!(out.contains("/"));
    assert!(out.contains("a [dummy]"));
    assert!(out.contains("b.txt"));
}

#[test]
fn test_invariants_after_mixed_workload() {
    let mut tree = attach("workload");
    for i in 0..40 {
        tree.add_file(&format!("d{}/e{}/f{i}", i % 5, i % 3), &format!("p{i}"), 0, true)
            .unwrap();
    }
    for i in 0..5 {
        tree.add_directory(&format!("d{i}"), &format!("dir{i}"), 0, true)
            .unwrap();
    }
    let root = tree.root().unwrap();
    check_invariants(&root);

    // Spot-check payload visibility after the churn.
    let hit = tree.find_by_path("d4/e0/f39").unwrap().unwrap();
    assert_eq!(payload(&hit), "p39");
}
