//! End-to-end workflow tests for the refseal engine
//!
//! These tests walk the complete lifecycle the way an operator would:
//! bootstrap a root of trust, delegate policy authorship, protect
//! references and paths, record changes, and verify them - locally and
//! across a controller/network deployment.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::rngs::OsRng;

use refseal_core::{
    Key, ObjectId, Principal, Repository, RulePattern, SecretKey, SignatureVerifier, Snapshot,
};
use refseal_policy::{GlobalRule, PolicyStore, RepositoryLink, Rule, TOP_LEVEL_POLICY};
use refseal_rsl::{propagate, PropagateOptions, RecordOptions, ReferenceStateLog};
use refseal_verify::{verify_network, NetworkOptions, VerificationEngine};

struct Actor {
    secret: SecretKey,
    principal: Principal,
}

fn actor(id: &str) -> Actor {
    let secret = SecretKey::generate(&mut OsRng);
    let principal = Principal::new(id, Key::from_public_key(secret.public_key().unwrap()));
    Actor { secret, principal }
}

fn commit(repo: &Repository, author: &Actor, files: &[(&str, &[u8])], message: &str) -> ObjectId {
    let parent = repo.read_ref("refs/heads/main").unwrap();
    let mut tree: BTreeMap<String, ObjectId> = match parent {
        Some(id) => repo.get_record::<Snapshot>(&id).unwrap().files,
        None => BTreeMap::new(),
    };
    for (path, content) in files {
        let blob = repo.put_blob(content).unwrap();
        tree.insert(path.to_string(), blob);
    }
    let snapshot = Snapshot::create(parent, tree, message, Utc::now(), &author.secret).unwrap();
    let id = repo.put_record(&snapshot).unwrap();
    repo.update_ref("refs/heads/main", id, parent).unwrap();
    id
}

fn record(repo: &Repository, recorder: &Actor) {
    ReferenceStateLog::new(repo)
        .record("main", &recorder.secret, &RecordOptions::default())
        .unwrap();
}

/// Walks the single-repository lifecycle: protect main, accept the
/// authorized change, then reject the unauthorized one.
#[test]
fn test_single_repository_lifecycle() {
    let repo = Repository::in_memory();
    let verifier = SignatureVerifier::new();
    let root = actor("root");
    let policy_author = actor("targets");
    let alice = actor("Alice");
    let mallory = actor("Mallory");

    // ==========================================
    // STEP 1: Bootstrap the root of trust
    // ==========================================
    let store = PolicyStore::new(&repo);
    store.trust_init(root.principal.clone()).unwrap();
    store
        .trust_add_policy_principal(policy_author.principal.clone())
        .unwrap();
    store.trust_sign(&root.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    // ==========================================
    // STEP 2: Author the policy protecting main
    // ==========================================
    store.policy_init(TOP_LEVEL_POLICY).unwrap();
    store
        .policy_add_principal(TOP_LEVEL_POLICY, alice.principal.clone())
        .unwrap();
    store
        .policy_add_rule(
            TOP_LEVEL_POLICY,
            Rule {
                name: "protect-main".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                authorized: ["Alice".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    store.policy_stage(TOP_LEVEL_POLICY).unwrap();
    store
        .policy_sign(TOP_LEVEL_POLICY, &policy_author.secret)
        .unwrap();
    store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

    // ==========================================
    // STEP 3: Authorized change verifies
    // ==========================================
    commit(&repo, &alice, &[("README.md", b"Hello, world!\n")], "Initial commit");
    record(&repo, &alice);

    let engine = VerificationEngine::new(&repo).unwrap();
    let verdict = engine.verify_reference("main", None).unwrap();
    assert!(verdict.accepted, "verdict: {:?}", verdict);

    let good_commit = repo.read_ref("refs/heads/main").unwrap().unwrap();
    assert!(engine.verify_snapshot(good_commit).unwrap().accepted);

    // ==========================================
    // STEP 4: Unauthorized change is rejected
    // ==========================================
    commit(
        &repo,
        &mallory,
        &[("README.md", b"This is not allowed!\n")],
        "Update README.md",
    );
    record(&repo, &mallory);

    let verdict = engine.verify_reference("main", None).unwrap();
    assert!(!verdict.accepted);
    assert_eq!(verdict.violated_rule.as_deref(), Some("protect-main"));

    let bad_commit = repo.read_ref("refs/heads/main").unwrap().unwrap();
    assert!(!engine.verify_snapshot(bad_commit).unwrap().accepted);

    // Full-history verification trips over the same entry
    let verdict = engine.verify_reference_full("main").unwrap();
    assert!(!verdict.accepted);
    assert_eq!(verdict.violated_rule.as_deref(), Some("protect-main"));
}

/// File-protection vs branch-protection interaction: an RSL record by an
/// authorized recorder does not excuse an unauthorized author touching a
/// protected file.
#[test]
fn test_file_rule_catches_what_branch_rule_misses() {
    let repo = Repository::in_memory();
    let verifier = SignatureVerifier::new();
    let root = actor("root");
    let policy_author = actor("targets");
    let alice = actor("Alice");
    let mallory = actor("Mallory");

    let store = PolicyStore::new(&repo);
    store.trust_init(root.principal.clone()).unwrap();
    store
        .trust_add_policy_principal(policy_author.principal.clone())
        .unwrap();
    store.trust_sign(&root.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    store.policy_init(TOP_LEVEL_POLICY).unwrap();
    store
        .policy_add_principal(TOP_LEVEL_POLICY, alice.principal.clone())
        .unwrap();
    store
        .policy_add_rule(
            TOP_LEVEL_POLICY,
            Rule {
                name: "protect-main".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                authorized: ["Alice".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    store
        .policy_add_rule(
            TOP_LEVEL_POLICY,
            Rule {
                name: "protect-readme".to_string(),
                patterns: vec![RulePattern::parse("path:README.md").unwrap()],
                authorized: ["Alice".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    store
        .policy_sign(TOP_LEVEL_POLICY, &policy_author.secret)
        .unwrap();
    store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

    // Mallory authors the change to README.md, but Alice records it
    commit(&repo, &alice, &[("README.md", b"fine\n")], "baseline");
    record(&repo, &alice);
    commit(&repo, &mallory, &[("README.md", b"sneaky\n")], "Update README.md");
    record(&repo, &alice);

    let engine = VerificationEngine::new(&repo).unwrap();
    let verdict = engine.verify_reference("main", None).unwrap();
    assert!(!verdict.accepted);
    assert_eq!(verdict.violated_rule.as_deref(), Some("protect-readme"));
    // The branch rule itself passed
    assert!(verdict.satisfied.iter().any(|s| s.rule == "protect-main"));
}

/// 2-of-3 root ceremony: one signature is not enough to apply, two are.
#[test]
fn test_multi_root_threshold_ceremony() {
    let repo = Repository::in_memory();
    let verifier = SignatureVerifier::new();
    let r1 = actor("R1");
    let r2 = actor("R2");
    let r3 = actor("R3");

    let store = PolicyStore::new(&repo);
    store.trust_init(r1.principal.clone()).unwrap();
    store.trust_sign(&r1.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    // Grow to three roots with a 2-of-3 threshold
    store.trust_add_root_principal(r2.principal.clone()).unwrap();
    store.trust_add_root_principal(r3.principal.clone()).unwrap();
    store.trust_update_root_threshold(2).unwrap();
    store.trust_sign(&r1.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    // The next revision needs two of the three roots
    store.trust_make_controller().unwrap();
    store.trust_sign(&r2.secret).unwrap();
    let err = store.trust_apply(&verifier).unwrap_err();
    assert!(matches!(err, refseal_core::Error::Trust(_)));
    assert!(err.to_string().contains("1 of 2"));

    store.trust_sign(&r3.secret).unwrap();
    store.trust_apply(&verifier).unwrap();
    assert!(store.require_trust().unwrap().document.controller);
}

/// Controller/network deployment: global rules flow from the controller,
/// propagation is idempotent, and a bad change in one member is
/// attributed to that member.
#[test]
fn test_controller_network_verification() {
    let controller_dir = tempfile::TempDir::new().unwrap();
    let network_dir = tempfile::TempDir::new().unwrap();
    let verifier = SignatureVerifier::new();

    let controller_root = actor("controller-root");
    let network_root = actor("network-root");
    let network_policy_author = actor("network-targets");
    let dev = actor("Dev");
    let outsider = actor("Outsider");

    // ==========================================
    // STEP 1: Controller setup with a global rule
    // ==========================================
    let controller = Repository::init(controller_dir.path()).unwrap();
    let store = PolicyStore::new(&controller);
    store.trust_init(controller_root.principal.clone()).unwrap();
    store.trust_make_controller().unwrap();
    store
        .trust_add_global_rule(GlobalRule::Threshold {
            name: "global-branch-threshold".to_string(),
            patterns: vec![RulePattern::parse("ref:refs/heads/*").unwrap()],
            threshold: 1,
        })
        .unwrap();
    store
        .trust_add_network_repository(RepositoryLink {
            name: "network".to_string(),
            location: network_dir.path().to_path_buf(),
            initial_root_principal: network_root.principal.clone(),
        })
        .unwrap();
    store.trust_sign(&controller_root.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    // ==========================================
    // STEP 2: Network member setup
    // ==========================================
    let network = Repository::init(network_dir.path()).unwrap();
    let member_store = PolicyStore::new(&network);
    member_store.trust_init(network_root.principal.clone()).unwrap();
    member_store
        .trust_add_policy_principal(network_policy_author.principal.clone())
        .unwrap();
    member_store
        .trust_add_controller_repository(RepositoryLink {
            name: "controller".to_string(),
            location: controller_dir.path().to_path_buf(),
            initial_root_principal: controller_root.principal.clone(),
        })
        .unwrap();
    member_store.trust_sign(&network_root.secret).unwrap();
    member_store.trust_apply(&verifier).unwrap();

    member_store.policy_init(TOP_LEVEL_POLICY).unwrap();
    member_store
        .policy_add_principal(TOP_LEVEL_POLICY, dev.principal.clone())
        .unwrap();
    member_store
        .policy_add_rule(
            TOP_LEVEL_POLICY,
            Rule {
                name: "protect-main".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                authorized: ["Dev".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    member_store
        .policy_sign(TOP_LEVEL_POLICY, &network_policy_author.secret)
        .unwrap();
    member_store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

    // ==========================================
    // STEP 3: Authorized change passes the network
    // ==========================================
    commit(&network, &dev, &[("service.rs", b"fn main() {}\n")], "add service");
    record(&network, &dev);

    let verdict = verify_network(&controller, &NetworkOptions::default()).unwrap();
    assert!(verdict.accepted(), "verdict: {:?}", verdict);

    // The controller's global rule was evaluated for the member
    let member = &verdict.members[0];
    assert_eq!(member.repository, "network");
    assert!(member.verdicts[0]
        .satisfied
        .iter()
        .any(|s| s.rule == "global-branch-threshold"));

    // Propagation happened and is idempotent
    let copied_again = propagate(&controller, &PropagateOptions::default()).unwrap();
    assert_eq!(copied_again.copied, vec![("network".to_string(), 0)]);
    let controller_log = ReferenceStateLog::new(&controller);
    assert_eq!(
        controller_log
            .entries_for_ref("main", Some("network"))
            .unwrap()
            .len(),
        1
    );

    // ==========================================
    // STEP 4: Unauthorized change is attributed to the member
    // ==========================================
    commit(&network, &outsider, &[("service.rs", b"backdoor\n")], "tweak");
    record(&network, &outsider);

    let verdict = verify_network(&controller, &NetworkOptions::default()).unwrap();
    assert!(!verdict.accepted());
    assert_eq!(verdict.failed_members(), vec!["network"]);
}

/// Delegation ceremony: Alice, trusted for main, hands authority to Bob
/// through a delegated policy that she signs; Bob's change then
/// verifies.
#[test]
fn test_delegated_policy_workflow() {
    let repo = Repository::in_memory();
    let verifier = SignatureVerifier::new();
    let root = actor("root");
    let policy_author = actor("targets");
    let alice = actor("Alice");
    let bob = actor("Bob");

    let store = PolicyStore::new(&repo);
    store.trust_init(root.principal.clone()).unwrap();
    store
        .trust_add_policy_principal(policy_author.principal.clone())
        .unwrap();
    store.trust_sign(&root.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    store.policy_init(TOP_LEVEL_POLICY).unwrap();
    store
        .policy_add_principal(TOP_LEVEL_POLICY, alice.principal.clone())
        .unwrap();
    store
        .policy_add_rule(
            TOP_LEVEL_POLICY,
            Rule {
                name: "protect-main".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                authorized: ["Alice".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    store
        .policy_sign(TOP_LEVEL_POLICY, &policy_author.secret)
        .unwrap();
    store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

    // Alice's own change verifies
    commit(&repo, &alice, &[("README.md", b"Hello, world!\n")], "Initial commit");
    record(&repo, &alice);
    let engine = VerificationEngine::new(&repo).unwrap();
    assert!(engine.verify_reference("main", None).unwrap().accepted);

    // Alice delegates to Bob; only her signature can apply the child
    store.policy_init("protect-main").unwrap();
    store
        .policy_add_principal("protect-main", bob.principal.clone())
        .unwrap();
    store
        .policy_add_rule(
            "protect-main",
            Rule {
                name: "protect-main-delegated".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                authorized: ["Bob".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    assert!(matches!(
        store.policy_apply("protect-main", &verifier),
        Err(refseal_core::Error::Trust(_))
    ));
    store.policy_sign("protect-main", &alice.secret).unwrap();
    store.policy_apply("protect-main", &verifier).unwrap();

    // Bob's change now verifies through the delegated policy
    commit(&repo, &bob, &[("README.md", b"Hello, Bob!\n")], "Bob's change");
    record(&repo, &bob);
    let verdict = engine.verify_reference("main", None).unwrap();
    assert!(verdict.accepted, "verdict: {:?}", verdict);
    assert!(verdict
        .satisfied
        .iter()
        .any(|s| s.rule == "protect-main-delegated"));
}

/// Force-push protection through a controller-style global rule.
#[test]
fn test_block_force_push_global_rule() {
    let repo = Repository::in_memory();
    let verifier = SignatureVerifier::new();
    let root = actor("root");
    let policy_author = actor("targets");
    let alice = actor("Alice");

    let store = PolicyStore::new(&repo);
    store.trust_init(root.principal.clone()).unwrap();
    store
        .trust_add_policy_principal(policy_author.principal.clone())
        .unwrap();
    store
        .trust_add_global_rule(GlobalRule::BlockForcePush {
            name: "no-force-push".to_string(),
            patterns: vec![RulePattern::parse("ref:refs/heads/*").unwrap()],
        })
        .unwrap();
    store.trust_sign(&root.secret).unwrap();
    store.trust_apply(&verifier).unwrap();

    store.policy_init(TOP_LEVEL_POLICY).unwrap();
    store
        .policy_add_principal(TOP_LEVEL_POLICY, alice.principal.clone())
        .unwrap();
    store
        .policy_add_rule(
            TOP_LEVEL_POLICY,
            Rule {
                name: "protect-main".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                authorized: ["Alice".to_string()].into(),
                threshold: 1,
            },
        )
        .unwrap();
    store
        .policy_sign(TOP_LEVEL_POLICY, &policy_author.secret)
        .unwrap();
    store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

    // Fast-forward history passes
    commit(&repo, &alice, &[("a.txt", b"one\n")], "one");
    record(&repo, &alice);
    commit(&repo, &alice, &[("a.txt", b"two\n")], "two");
    record(&repo, &alice);

    let engine = VerificationEngine::new(&repo).unwrap();
    assert!(engine.verify_reference("main", None).unwrap().accepted);

    // Rewriting main to an unrelated snapshot is a force push
    let orphan = Snapshot::create(
        None,
        BTreeMap::new(),
        "rewrite",
        Utc::now(),
        &alice.secret,
    )
    .unwrap();
    let orphan_id = repo.put_record(&orphan).unwrap();
    let current = repo.read_ref("refs/heads/main").unwrap();
    repo.update_ref("refs/heads/main", orphan_id, current).unwrap();
    record(&repo, &alice);

    let verdict = engine.verify_reference("main", None).unwrap();
    assert!(!verdict.accepted);
    assert_eq!(verdict.violated_rule.as_deref(), Some("no-force-push"));
}
