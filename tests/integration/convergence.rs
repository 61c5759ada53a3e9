//! End-to-end convergence scenarios over in-memory links.

use skein_core::secret::{Capability, Secret};

use crate::{blob, Net, TestNode};

#[test]
fn two_peers_converge_on_a_single_file() {
    let secret = Secret::generate();
    let a = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);

    let body = blob(4 * 1024 * 1024, 42);
    a.write("f", &body);

    let mut net = Net::new(vec![a, b]);
    net.nodes[0].scan();
    net.connect(0, 1);
    net.settle();

    assert!(net.converged(), "revision maps differ after settle");
    assert_eq!(net.nodes[1].read("f").as_deref(), Some(&body[..]));
    assert!(net.nodes[0].all_assembled());
    assert!(net.nodes[1].all_assembled());

    // Traffic was actually counted on the receiving session.
    let status = net.nodes[1].status();
    assert_eq!(status.peers.len(), 1);
    assert!(status.peers[0].down_bytes as usize > body.len() / 2);
}

#[test]
fn bidirectional_sync_merges_both_sides() {
    let secret = Secret::generate();
    let a = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);

    a.write("from-a.bin", &blob(300_000, 1));
    b.write("from-b.bin", &blob(200_000, 2));

    let mut net = Net::new(vec![a, b]);
    net.nodes[0].scan();
    net.nodes[1].scan();
    net.connect(0, 1);
    net.settle();

    assert!(net.converged());
    for node in &net.nodes {
        assert!(node.read("from-a.bin").is_some());
        assert!(node.read("from-b.bin").is_some());
        assert!(node.all_assembled());
    }
}

#[test]
fn rescan_after_sync_is_silent() {
    let secret = Secret::generate();
    let a = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);
    a.write("hello.txt", "abc".repeat(100_000).as_bytes());

    let mut net = Net::new(vec![a, b]);
    net.nodes[0].scan();
    net.connect(0, 1);
    net.settle();
    let before = net.nodes[1].revisions();

    // Nothing changed on disk: a re-scan must gossip nothing.
    net.nodes[0].scan();
    assert!(!net.pump_once(), "unchanged rescan produced traffic");
    assert_eq!(net.nodes[1].revisions(), before);
}

#[test]
fn higher_revision_wins_the_race_and_archives_the_loser() {
    let secret = Secret::generate();
    let a = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);

    let old_body = blob(150_000, 7);
    let new_body = blob(150_000, 8);
    a.write("p.txt", &old_body);

    let mut net = Net::new(vec![a, b]);
    net.nodes[0].scan();
    // B edits strictly later, so its revision is strictly higher.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    net.nodes[1].write("p.txt", &new_body);
    net.nodes[1].scan();
    let winner_revision = *net.nodes[1].revisions().values().next().unwrap();
    let loser_revision = *net.nodes[0].revisions().values().next().unwrap();
    assert!(winner_revision > loser_revision);

    net.connect(0, 1);
    net.settle();

    assert!(net.converged());
    assert_eq!(
        net.nodes[0].revisions().values().next().copied(),
        Some(winner_revision)
    );
    assert_eq!(net.nodes[0].read("p.txt").as_deref(), Some(&new_body[..]));
    assert_eq!(net.nodes[1].read("p.txt").as_deref(), Some(&new_body[..]));
    // A's superseded version went into its trash archive.
    assert_eq!(net.nodes[0].archive_entries(), 1);
    assert_eq!(net.nodes[1].archive_entries(), 0);
}

#[test]
fn deletion_propagates_and_archives() {
    let secret = Secret::generate();
    let a = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);
    a.write("g.txt", b"short lived");

    let mut net = Net::new(vec![a, b]);
    net.nodes[0].scan();
    net.connect(0, 1);
    net.settle();
    assert!(net.nodes[1].read("g.txt").is_some());

    std::thread::sleep(std::time::Duration::from_millis(1100));
    std::fs::remove_file(net.nodes[0].data().join("g.txt")).unwrap();
    net.nodes[0].scan();
    net.settle();

    assert!(net.converged());
    assert_eq!(net.nodes[1].read("g.txt"), None, "deletion did not propagate");
    // The deleted copy is preserved in B's trash.
    assert_eq!(net.nodes[1].archive_entries(), 1);
    let status = net.nodes[1].status();
    assert_eq!(status.deleted, 1);
    assert_eq!(status.files, 0);
}

#[test]
fn directories_and_symlinks_materialize() {
    let secret = Secret::generate();
    let a = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);

    a.write("docs/inner/note.md", b"# hi");
    #[cfg(unix)]
    std::os::unix::fs::symlink("docs/inner/note.md", a.data().join("shortcut")).unwrap();

    let mut net = Net::new(vec![a, b]);
    net.nodes[0].scan();
    net.connect(0, 1);
    net.settle();

    assert!(net.converged());
    assert!(net.nodes[1].data().join("docs/inner").is_dir());
    assert_eq!(
        net.nodes[1].read("docs/inner/note.md").as_deref(),
        Some(&b"# hi"[..])
    );
    #[cfg(unix)]
    assert_eq!(
        std::fs::read_link(net.nodes[1].data().join("shortcut")).unwrap(),
        std::path::PathBuf::from("docs/inner/note.md")
    );
}

#[test]
fn three_peers_fan_out_from_one_seed() {
    let secret = Secret::generate();
    let seed = TestNode::new(&secret, Capability::ReadWrite);
    let b = TestNode::new(&secret, Capability::ReadWrite);
    let c = TestNode::new(&secret, Capability::ReadWrite);

    let body = blob(2 * 1024 * 1024, 99);
    seed.write("shared.bin", &body);

    let mut net = Net::new(vec![seed, b, c]);
    net.nodes[0].scan();
    // A line topology: c can only reach the seed through b.
    net.connect(0, 1);
    net.connect(1, 2);
    net.settle();

    assert!(net.converged());
    assert_eq!(net.nodes[1].read("shared.bin").as_deref(), Some(&body[..]));
    assert_eq!(net.nodes[2].read("shared.bin").as_deref(), Some(&body[..]));
}
