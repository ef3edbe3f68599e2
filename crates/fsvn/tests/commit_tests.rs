//! End-to-end commit scenarios against live on-disk repositories.

use fsvn::types::{ChangeKind, RevisionNumber};
use fsvn::{FsConfig, FsError, Repository};
use tempfile::TempDir;

fn new_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::create(dir.path()).unwrap();
    (dir, repo)
}

#[test]
fn s1_first_commit_creates_readable_revision() {
    let (_dir, repo) = new_repo();
    assert_eq!(repo.youngest().unwrap(), RevisionNumber(0));

    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"hello\n").unwrap();
    let rev = txn.commit().unwrap();
    assert_eq!(rev, RevisionNumber(1));
    assert_eq!(repo.youngest().unwrap(), RevisionNumber(1));

    assert_eq!(repo.read_file(RevisionNumber(1), "/iota").unwrap(), b"hello\n");

    let changes = repo.changes(RevisionNumber(1)).unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes["/iota"];
    assert_eq!(change.kind, ChangeKind::Add);
    assert!(change.text_mod);

    // The committed data rep carries md5("hello\n").
    let fs = repo.fs();
    let root = fsvn::fsvn_fs::tree::revision_root(fs, RevisionNumber(1)).unwrap();
    let iota = fsvn::fsvn_fs::tree::node_at_path(fs, &root, "/iota").unwrap();
    assert_eq!(
        iota.data_rep.as_ref().unwrap().md5.hex(),
        "b1946ac92492d2347c6235b4d2611184"
    );
}

#[test]
fn commits_advance_youngest_by_one_with_all_files_present() {
    let (_dir, repo) = new_repo();
    for i in 1..=3u32 {
        let txn = repo.begin().unwrap();
        txn.add_file(&format!("/file{i}"), format!("content {i}\n").as_bytes())
            .unwrap();
        assert_eq!(txn.commit().unwrap(), RevisionNumber(i));
    }
    assert_eq!(repo.youngest().unwrap(), RevisionNumber(3));

    let layout = repo.fs().layout();
    for i in 1..=3u32 {
        let rev = RevisionNumber(i);
        assert!(layout.rev_file(rev).is_file(), "missing rev file r{i}");
        assert!(layout.l2p_file(rev).is_file(), "missing l2p index r{i}");
        assert!(layout.p2l_file(rev).is_file(), "missing p2l index r{i}");
        assert!(layout.revprops_file(rev).is_file(), "missing revprops r{i}");
    }
    // Earlier files are still readable at their revisions and at HEAD.
    assert_eq!(
        repo.read_file(RevisionNumber(3), "/file1").unwrap(),
        b"content 1\n"
    );
}

#[test]
fn s2_stale_base_commit_fails_and_leaves_repo_untouched() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"r1\n").unwrap();
    txn.commit().unwrap();

    let t1 = repo.begin_at(RevisionNumber(1)).unwrap();
    let t2 = repo.begin_at(RevisionNumber(1)).unwrap();
    t1.modify_file("/iota", b"from t1\n").unwrap();
    t2.modify_file("/iota", b"from t2\n").unwrap();

    assert_eq!(t1.commit().unwrap(), RevisionNumber(2));

    let loser_name = t2.name();
    let err = t2.commit().unwrap_err();
    assert!(matches!(
        err,
        FsError::TxnOutOfDate {
            base_rev: 1,
            youngest: 2
        }
    ));

    // The failed commit wrote nothing: no r3 artifacts exist and HEAD
    // content is the winner's.
    let layout = repo.fs().layout();
    assert!(!layout.rev_file(RevisionNumber(3)).exists());
    assert!(!layout.revprops_file(RevisionNumber(3)).exists());
    assert_eq!(
        repo.read_file(RevisionNumber(2), "/iota").unwrap(),
        b"from t1\n"
    );

    // The losing transaction is still on disk and purgeable.
    assert!(repo.transactions().unwrap().contains(&loser_name));
    repo.purge_txn(&loser_name).unwrap();
    assert!(!repo.transactions().unwrap().contains(&loser_name));
}

#[test]
fn concurrent_commits_produce_one_winner_and_one_stale() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"base\n").unwrap();
    txn.commit().unwrap();

    let t1 = repo.begin_at(RevisionNumber(1)).unwrap();
    let t2 = repo.begin_at(RevisionNumber(1)).unwrap();
    t1.modify_file("/iota", b"one\n").unwrap();
    t2.modify_file("/iota", b"two\n").unwrap();

    let (r1, r2) = std::thread::scope(|scope| {
        let h1 = scope.spawn(|| t1.commit());
        let h2 = scope.spawn(|| t2.commit());
        (h1.join().unwrap(), h2.join().unwrap())
    });

    let outcomes = [r1, r2];
    let wins = outcomes
        .iter()
        .filter(|r| matches!(r, Ok(rev) if *rev == RevisionNumber(2)))
        .count();
    let stale = outcomes
        .iter()
        .filter(|r| matches!(r, Err(FsError::TxnOutOfDate { .. })))
        .count();
    assert_eq!((wins, stale), (1, 1), "outcomes: {outcomes:?}");
    assert_eq!(repo.youngest().unwrap(), RevisionNumber(2));
}

#[test]
fn s3_identical_content_shares_the_older_representation() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"alpha\n").unwrap();
    txn.commit().unwrap();

    let txn = repo.begin().unwrap();
    txn.modify_file("/iota", b"beta\n").unwrap();
    txn.commit().unwrap();

    // Same content as r1; rep sharing must reference r1's item instead of
    // storing the bytes again.
    let txn = repo.begin().unwrap();
    txn.modify_file("/iota", b"alpha\n").unwrap();
    txn.commit().unwrap();

    let fs = repo.fs();
    let r1_root = fsvn::fsvn_fs::tree::revision_root(fs, RevisionNumber(1)).unwrap();
    let r1_iota = fsvn::fsvn_fs::tree::node_at_path(fs, &r1_root, "/iota").unwrap();
    let r3_root = fsvn::fsvn_fs::tree::revision_root(fs, RevisionNumber(3)).unwrap();
    let r3_iota = fsvn::fsvn_fs::tree::node_at_path(fs, &r3_root, "/iota").unwrap();

    assert_eq!(
        r3_iota.data_rep.as_ref().unwrap().id,
        r1_iota.data_rep.as_ref().unwrap().id,
        "r3 should reference r1's representation"
    );
    assert_eq!(repo.read_file(RevisionNumber(3), "/iota").unwrap(), b"alpha\n");
}

#[test]
fn s4_delta_base_is_skip_delta_with_linear_tail() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::create_with_config(
        dir.path(),
        FsConfig::default().max_linear_deltification(4),
    )
    .unwrap();

    // Version k of /iota is committed in r(k); the staged successor while
    // committing r(k+1) has predecessor count k.
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"v1\n").unwrap();
    txn.commit().unwrap();

    // predecessor count -> expected base revision of the chosen rep.
    let expectations = [
        (1u32, Some(1u32)),  // linear tail
        (2, Some(2)),        // linear tail
        (4, Some(1)),        // skip-delta: 4 & 3 == 0
        (5, Some(5)),        // linear again right after the skip point
        (12, Some(9)),       // skip-delta mid-range: 12 & 11 == 8
        (16, Some(1)),       // skip-delta: 16 & 15 == 0
    ];

    for count in 2..=17u32 {
        let txn = repo.begin().unwrap();
        txn.modify_file("/iota", format!("v{count}\n").as_bytes())
            .unwrap();

        let fs = repo.fs();
        let staged =
            fsvn::fsvn_fs::mutation::make_path_mutable(fs, txn.raw().txn_id, "/iota").unwrap();
        let p = staged.predecessor_count;
        let base = fsvn::fsvn_fs::delta_base::choose_delta_base(fs, &staged, false).unwrap();

        if let Some((_, expected)) = expectations.iter().find(|(pred, _)| *pred == p) {
            let got = base
                .as_ref()
                .map(|rep| rep.id.change_set.revision().unwrap().get());
            assert_eq!(got, *expected, "wrong delta base for predecessor count {p}");
        }
        if let Some(base) = &base {
            // Invariant: reconstruction never exceeds 2*linear + 2 links.
            let chain = fsvn::fsvn_fs::rep_read::rep_chain_length(fs, base).unwrap();
            assert!(chain <= 2 * 4 + 2, "chain {chain} too long at count {p}");
        }

        txn.commit().unwrap();
    }
}

#[test]
fn s5_deleting_a_directory_folds_away_descendant_changes() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_dir("/a").unwrap();
    txn.add_dir("/a/b").unwrap();
    txn.commit().unwrap();

    let txn = repo.begin().unwrap();
    txn.add_file("/a/b/c", b"doomed\n").unwrap();
    txn.delete("/a").unwrap();
    let rev = txn.commit().unwrap();

    let changes = repo.changes(rev).unwrap();
    assert_eq!(changes.len(), 1, "changes: {changes:?}");
    assert_eq!(changes["/a"].kind, ChangeKind::Delete);

    // And the tree agrees.
    assert!(matches!(
        repo.read_file(rev, "/a/b/c"),
        Err(FsError::PathNotFound { .. })
    ));
}

#[test]
fn s6_move_without_source_deletion_is_rejected() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/foo", b"payload\n").unwrap();
    txn.commit().unwrap();

    let txn = repo.begin().unwrap();
    txn.stage_move("/foo", "/bar").unwrap();
    let err = txn.commit().unwrap_err();
    assert!(
        matches!(&err, FsError::IncompleteMove { path } if path == "/foo"),
        "got: {err}"
    );
}

#[test]
fn complete_move_commits_and_records_copyfrom() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/foo", b"payload\n").unwrap();
    txn.commit().unwrap();

    let txn = repo.begin().unwrap();
    txn.move_node("/foo", "/bar").unwrap();
    let rev = txn.commit().unwrap();

    let changes = repo.changes(rev).unwrap();
    assert_eq!(changes["/bar"].kind, ChangeKind::Move);
    assert_eq!(changes["/foo"].kind, ChangeKind::Delete);
    // Moves always record copy-from against the commit's parent.
    let (copy_rev, copy_path) = changes["/bar"].copyfrom.clone().unwrap();
    assert_eq!(copy_rev, RevisionNumber(rev.get() - 1));
    assert_eq!(copy_path, "/foo");

    assert_eq!(repo.read_file(rev, "/bar").unwrap(), b"payload\n");
    assert!(matches!(
        repo.read_file(rev, "/foo"),
        Err(FsError::PathNotFound { .. })
    ));
}

#[test]
fn duplicate_move_sources_are_ambiguous() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/foo", b"payload\n").unwrap();
    txn.commit().unwrap();

    let txn = repo.begin().unwrap();
    txn.stage_move("/foo", "/bar").unwrap();
    txn.stage_move("/foo", "/baz").unwrap();
    txn.delete("/foo").unwrap();
    let err = txn.commit().unwrap_err();
    assert!(
        matches!(&err, FsError::AmbiguousMove { path } if path == "/foo"),
        "got: {err}"
    );
}

#[test]
fn abandoned_transaction_never_advances_youngest() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"never committed\n").unwrap();
    let name = txn.name();
    drop(txn); // simulate a crashed writer: on-disk state stays behind

    assert_eq!(repo.youngest().unwrap(), RevisionNumber(0));
    assert!(repo.transactions().unwrap().contains(&name));

    // Stale transactions are garbage-collectable and do not disturb new
    // commits.
    repo.purge_txn(&name).unwrap();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"committed\n").unwrap();
    assert_eq!(txn.commit().unwrap(), RevisionNumber(1));
}

#[test]
fn fresh_txn_next_ids_file_is_zero_zero() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    let raw = txn.raw();
    let contents =
        std::fs::read_to_string(repo.fs().layout().txn_next_ids(raw.txn_id)).unwrap();
    assert_eq!(contents, "0 0\n");
}

#[test]
fn revprops_are_finalized_with_commit_date() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"x\n").unwrap();
    txn.set_txn_prop("svn:log", Some(b"first commit")).unwrap();
    let rev = txn.commit().unwrap();

    let props = repo.revprops(rev).unwrap();
    assert_eq!(props["svn:log"], b"first commit");
    let date = std::str::from_utf8(&props["svn:date"]).unwrap();
    assert_eq!(date.len(), 27);
    assert!(date.ends_with('Z'));
    // Internal markers never leak into revprops.
    assert!(!props.contains_key("svn:client-date"));
    assert!(!props.contains_key("svn:check-ood"));
    assert!(!props.contains_key("svn:check-locks"));
}

#[test]
fn client_supplied_date_survives_commit() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_file("/iota", b"x\n").unwrap();
    let stamp = b"2020-02-02T02:02:02.000000Z";
    txn.set_txn_prop("svn:date", Some(stamp)).unwrap();
    let rev = txn.commit().unwrap();

    let props = repo.revprops(rev).unwrap();
    assert_eq!(props["svn:date"], stamp);
}

#[test]
fn folded_changes_round_trip_through_the_revision_file() {
    let (_dir, repo) = new_repo();
    let txn = repo.begin().unwrap();
    txn.add_dir("/d").unwrap();
    txn.add_file("/d/f", b"one\n").unwrap();
    txn.add_file("/g", b"two\n").unwrap();
    txn.modify_file("/g", b"two again\n").unwrap();
    let rev = txn.commit().unwrap();

    let changes = repo.changes(rev).unwrap();
    // /g's add and modify folded into a single record.
    assert_eq!(changes.len(), 3);
    assert_eq!(changes["/g"].kind, ChangeKind::Add);
    assert!(changes["/g"].text_mod);
    assert_eq!(changes["/d"].kind, ChangeKind::Add);
    assert_eq!(changes["/d/f"].kind, ChangeKind::Add);
}

#[test]
fn verify_before_commit_accepts_good_revisions() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::create_with_config(
        dir.path(),
        FsConfig::default().verify_before_commit(true),
    )
    .unwrap();
    let txn = repo.begin().unwrap();
    txn.add_dir("/d").unwrap();
    txn.add_file("/d/f", b"checked\n").unwrap();
    assert_eq!(txn.commit().unwrap(), RevisionNumber(1));
    assert_eq!(repo.read_file(RevisionNumber(1), "/d/f").unwrap(), b"checked\n");
}

#[test]
fn lock_verifier_can_veto_a_commit() {
    let dir = TempDir::new().unwrap();
    let mut fs = fsvn::fsvn_fs::FileSystem::create(dir.path(), FsConfig::default()).unwrap();
    fs.set_lock_verifier(Box::new(|path, _recurse| {
        if path == "/locked" {
            Err(FsError::LockFailed {
                path: path.into(),
                detail: "path is locked by another user".to_owned(),
            })
        } else {
            Ok(())
        }
    }));

    let txn = fsvn::fsvn_fs::begin_txn(&fs, RevisionNumber(0)).unwrap();
    let node = fsvn::fsvn_fs::make_node(&fs, txn.txn_id, "/locked", fsvn::types::NodeKind::File)
        .unwrap();
    let mut writer = fsvn::fsvn_fs::set_contents(&fs, node).unwrap();
    writer.write(b"contested\n").unwrap();
    writer.close().unwrap();

    let err = fsvn::fsvn_fs::commit(&fs, &txn).unwrap_err();
    assert!(matches!(err, FsError::LockFailed { .. }));
    assert_eq!(fs.youngest().unwrap(), RevisionNumber(0));
}

#[test]
fn rep_sharing_disabled_duplicates_content() {
    let dir = TempDir::new().unwrap();
    let repo =
        Repository::create_with_config(dir.path(), FsConfig::default().rep_sharing(false))
            .unwrap();
    let txn = repo.begin().unwrap();
    txn.add_file("/a", b"same\n").unwrap();
    txn.commit().unwrap();
    let txn = repo.begin().unwrap();
    txn.add_file("/b", b"same\n").unwrap();
    txn.commit().unwrap();

    let fs = repo.fs();
    let r2_root = fsvn::fsvn_fs::tree::revision_root(fs, RevisionNumber(2)).unwrap();
    let b = fsvn::fsvn_fs::tree::node_at_path(fs, &r2_root, "/b").unwrap();
    // Without sharing, /b got its own rep in r2.
    assert_eq!(
        b.data_rep
            .as_ref()
            .unwrap()
            .id
            .change_set
            .revision()
            .unwrap(),
        RevisionNumber(2)
    );
}

#[test]
fn deep_history_stays_readable() {
    // Exercises delta chains across many revisions end to end.
    let (_dir, repo) = new_repo();
    let mut body = String::from("line\n");
    let txn = repo.begin().unwrap();
    txn.add_file("/grow", body.as_bytes()).unwrap();
    txn.commit().unwrap();

    for i in 2..=12u32 {
        body.push_str(&format!("line {i}\n"));
        let txn = repo.begin().unwrap();
        txn.modify_file("/grow", body.as_bytes()).unwrap();
        assert_eq!(txn.commit().unwrap(), RevisionNumber(i));
    }

    // Every historical version reconstructs exactly.
    let mut expect = String::from("line\n");
    for i in 1..=12u32 {
        if i > 1 {
            expect.push_str(&format!("line {i}\n"));
        }
        assert_eq!(
            repo.read_file(RevisionNumber(i), "/grow").unwrap(),
            expect.as_bytes(),
            "mismatch at r{i}"
        );
    }
}
