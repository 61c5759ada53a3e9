//! Download-tier relays: nodes that store and forward ciphertext without
//! ever holding the symmetric key.

use skein_core::secret::{Capability, Secret};

use crate::{blob, Net, TestNode};

#[test]
fn download_tier_relays_between_writers() {
    let secret = Secret::generate();
    let author = TestNode::new(&secret, Capability::ReadWrite);
    let relay = TestNode::new(&secret, Capability::Download);
    let reader = TestNode::new(&secret, Capability::ReadOnly);

    let body = blob(1_500_000, 17);
    author.write("doc.bin", &body);

    let mut net = Net::new(vec![author, relay, reader]);
    net.nodes[0].scan();
    // The reader can only reach the author through the blind relay.
    net.connect(0, 1);
    net.connect(1, 2);
    net.settle();

    assert!(net.converged(), "all three tiers must agree on revisions");

    // The relay holds ciphertext blobs but no plaintext.
    let blocks = std::fs::read_dir(net.nodes[1].dir.path().join("system/blocks"))
        .unwrap()
        .count();
    assert!(blocks > 0, "relay stored no ciphertext");
    assert_eq!(net.nodes[1].read("doc.bin"), None, "relay must not decrypt");
    assert!(!net.nodes[1].all_assembled());

    // The read-only node assembled the real file through the relay.
    assert_eq!(net.nodes[2].read("doc.bin").as_deref(), Some(&body[..]));
    assert!(net.nodes[2].all_assembled());
}

#[test]
fn readonly_node_cannot_author_changes() {
    let secret = Secret::generate();
    let author = TestNode::new(&secret, Capability::ReadWrite);
    let reader = TestNode::new(&secret, Capability::ReadOnly);
    author.write("a.txt", b"authored");

    let mut net = Net::new(vec![author, reader]);
    net.nodes[0].scan();
    net.connect(0, 1);
    net.settle();
    assert_eq!(net.nodes[1].read("a.txt").as_deref(), Some(&b"authored"[..]));

    // Local edits on a read-only node produce no records: it has no
    // signing key, so its scan is a no-op.
    net.nodes[1].write("local-only.txt", b"scribble");
    net.nodes[1].scan();
    assert!(!net.pump_once());
    assert_eq!(net.nodes[0].read("local-only.txt"), None);
    assert_eq!(net.nodes[1].revisions().len(), 1);
}
