//! CLI subcommand definitions and handlers

use std::path::PathBuf;

use chrono::Utc;
use clap::Subcommand;
use rand::rngs::OsRng;

use refseal_core::{
    Error, Key, Principal, PublicKey, Repository, Result, RulePattern, SecretKey,
    SignatureVerifier, Snapshot,
};
use refseal_policy::{GlobalRule, PolicyStore, RepositoryLink, Rule, TOP_LEVEL_POLICY};
use refseal_rsl::{propagate, PropagateOptions, RecordOptions, ReferenceStateLog};

use crate::deadline_from;

#[derive(Subcommand)]
pub enum TrustCommands {
    /// Initialize the root of trust
    Init {
        /// Signing key file (also the initial root principal)
        #[arg(short = 'k', long = "key")]
        key: PathBuf,
    },

    /// Add a root key to the staged root of trust
    AddRootKey {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Public key file (or `gpg:<fingerprint>`) of the new root
        #[arg(long)]
        root_key: String,
    },

    /// Update the root signing threshold
    UpdateRootThreshold {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        threshold: u32,
    },

    /// Delegate a policy key in the staged root of trust
    AddPolicyKey {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Public key file (or `gpg:<fingerprint>`) of the policy author
        #[arg(long)]
        policy_key: String,
    },

    /// Update the policy signing threshold
    UpdatePolicyThreshold {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        threshold: u32,
    },

    /// Add a global rule to the staged root of trust
    AddGlobalRule {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        rule_name: String,

        /// Pattern(s), e.g. `ref:refs/heads/*` (repeatable)
        #[arg(long = "rule-pattern", required = true)]
        rule_patterns: Vec<String>,

        /// Rule type: `threshold` or `block-force-pushes`
        #[arg(long = "type", default_value = "threshold")]
        rule_type: String,

        #[arg(long, default_value_t = 1)]
        threshold: u32,
    },

    /// Mark this repository as a controller
    MakeController {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,
    },

    /// Register a network repository under this controller
    AddNetworkRepository {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        name: String,

        #[arg(long)]
        location: PathBuf,

        /// Public key file bootstrapping the member's root
        #[arg(long)]
        initial_root_principal: String,
    },

    /// Register a controller governing this repository
    AddControllerRepository {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        name: String,

        #[arg(long)]
        location: PathBuf,

        /// Public key file bootstrapping the controller's root
        #[arg(long)]
        initial_root_principal: String,
    },

    /// Sign the staged root of trust
    Sign {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,
    },

    /// Validate the staged root of trust without applying
    Stage {
        /// Skip remote side effects
        #[arg(long)]
        local_only: bool,

        /// Also sign the staged draft with this key
        #[arg(short = 'k', long = "key")]
        key: Option<PathBuf>,
    },

    /// Threshold-check and apply the staged root of trust
    Apply {
        /// Skip remote side effects
        #[arg(long)]
        local_only: bool,

        /// Also sign the staged draft with this key before applying
        #[arg(short = 'k', long = "key")]
        key: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Initialize a policy document
    Init {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Add a trusted key to a policy document
    AddKey {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Public key file (or `gpg:<fingerprint>`)
        #[arg(long)]
        public_key: String,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Add a trusted person (named principal with declared keys)
    AddPerson {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long = "person-ID")]
        person_id: String,

        /// Public key file(s) (or `gpg:<fingerprint>`) held by the person
        #[arg(long = "public-key", required = true)]
        public_keys: Vec<String>,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Add a threshold rule to a policy document
    AddRule {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        rule_name: String,

        /// Pattern(s), e.g. `ref:refs/heads/main` or `path:src/*`
        #[arg(long = "rule-pattern", required = true)]
        rule_patterns: Vec<String>,

        /// Authorize an already-added principal by ID (repeatable)
        #[arg(long = "authorize")]
        authorize: Vec<String>,

        /// Authorize by public key file or `gpg:<fingerprint>` (repeatable)
        #[arg(long = "authorize-key")]
        authorize_keys: Vec<String>,

        #[arg(long, default_value_t = 1)]
        threshold: u32,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Remove a rule from a policy document
    RemoveRule {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long)]
        rule_name: String,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Sign a staged policy document
    Sign {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Validate staged policy documents without applying
    Stage {
        /// Skip remote side effects
        #[arg(long)]
        local_only: bool,

        /// Also sign the staged draft with this key
        #[arg(short = 'k', long = "key")]
        key: Option<PathBuf>,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// Threshold-check and apply a staged policy document
    Apply {
        /// Skip remote side effects
        #[arg(long)]
        local_only: bool,

        /// Also sign the staged draft with this key before applying
        #[arg(short = 'k', long = "key")]
        key: Option<PathBuf>,

        #[arg(long, default_value = TOP_LEVEL_POLICY)]
        policy_name: String,
    },

    /// List every applied rule
    ListRules,
}

#[derive(Subcommand)]
pub enum RslCommands {
    /// Record the current state of a reference
    Record {
        /// Reference name (e.g. `main`)
        ref_name: String,

        /// Skip remote side effects; the local append still happens
        #[arg(long)]
        local_only: bool,

        /// Signing key (defaults to the configured signing key)
        #[arg(short = 'k', long = "key")]
        key: Option<PathBuf>,
    },

    /// Copy entries from linked repositories into the local log
    Propagate {
        /// Timeout in seconds for reaching linked repositories
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show the log, newest last
    Show,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Snapshot a directory and advance a reference to it
    Create {
        /// Reference to advance
        #[arg(long = "ref")]
        ref_name: String,

        /// Directory to snapshot
        #[arg(long)]
        dir: PathBuf,

        #[arg(short = 'm', long, default_value = "update")]
        message: String,

        /// Author signing key
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Additional approving key file(s)
        #[arg(long = "approve-key")]
        approve_keys: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate a signing key pair (`<output>` and `<output>.pub`)
    Generate {
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the key ID of a public key file
    Id {
        #[arg(short, long)]
        key: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum KeyringCommands {
    /// Register a fingerprint -> public key mapping
    Add {
        #[arg(long)]
        fingerprint: String,

        /// Public key file
        #[arg(long)]
        public_key: PathBuf,
    },

    /// List registered fingerprints
    List,
}

// ---- handlers ----

pub fn handle_trust(repo: &Repository, cmd: TrustCommands) -> Result<()> {
    let store = PolicyStore::new(repo);
    match cmd {
        TrustCommands::Init { key } => {
            let secret = SecretKey::load(&key)?;
            let principal = principal_from_secret(&secret)?;
            store.trust_init(principal)?;
            store.trust_sign(&secret)?;
            println!("✓ root of trust staged");
        }
        TrustCommands::AddRootKey { key, root_key } => {
            let secret = SecretKey::load(&key)?;
            let principal = principal_from_key_ref(&root_key)?;
            store.trust_add_root_principal(principal)?;
            store.trust_sign(&secret)?;
            println!("✓ root key added to staged root of trust");
        }
        TrustCommands::UpdateRootThreshold { key, threshold } => {
            let secret = SecretKey::load(&key)?;
            store.trust_update_root_threshold(threshold)?;
            store.trust_sign(&secret)?;
            println!("✓ root threshold set to {}", threshold);
        }
        TrustCommands::AddPolicyKey { key, policy_key } => {
            let secret = SecretKey::load(&key)?;
            let principal = principal_from_key_ref(&policy_key)?;
            store.trust_add_policy_principal(principal)?;
            store.trust_sign(&secret)?;
            println!("✓ policy key added to staged root of trust");
        }
        TrustCommands::UpdatePolicyThreshold { key, threshold } => {
            let secret = SecretKey::load(&key)?;
            store.trust_update_policy_threshold(threshold)?;
            store.trust_sign(&secret)?;
            println!("✓ policy threshold set to {}", threshold);
        }
        TrustCommands::AddGlobalRule {
            key,
            rule_name,
            rule_patterns,
            rule_type,
            threshold,
        } => {
            let secret = SecretKey::load(&key)?;
            let patterns = parse_patterns(&rule_patterns)?;
            let rule = match rule_type.as_str() {
                "threshold" => GlobalRule::Threshold {
                    name: rule_name.clone(),
                    patterns,
                    threshold,
                },
                "block-force-pushes" => GlobalRule::BlockForcePush {
                    name: rule_name.clone(),
                    patterns,
                },
                other => {
                    return Err(Error::Validation(format!(
                        "unknown global rule type '{}'",
                        other
                    )))
                }
            };
            store.trust_add_global_rule(rule)?;
            store.trust_sign(&secret)?;
            println!("✓ global rule '{}' staged", rule_name);
        }
        TrustCommands::MakeController { key } => {
            let secret = SecretKey::load(&key)?;
            store.trust_make_controller()?;
            store.trust_sign(&secret)?;
            println!("✓ repository staged as controller");
        }
        TrustCommands::AddNetworkRepository {
            key,
            name,
            location,
            initial_root_principal,
        } => {
            let secret = SecretKey::load(&key)?;
            store.trust_add_network_repository(RepositoryLink {
                name: name.clone(),
                location,
                initial_root_principal: principal_from_key_ref(&initial_root_principal)?,
            })?;
            store.trust_sign(&secret)?;
            println!("✓ network repository '{}' staged", name);
        }
        TrustCommands::AddControllerRepository {
            key,
            name,
            location,
            initial_root_principal,
        } => {
            let secret = SecretKey::load(&key)?;
            store.trust_add_controller_repository(RepositoryLink {
                name: name.clone(),
                location,
                initial_root_principal: principal_from_key_ref(&initial_root_principal)?,
            })?;
            store.trust_sign(&secret)?;
            println!("✓ controller repository '{}' staged", name);
        }
        TrustCommands::Sign { key } => {
            let secret = SecretKey::load(&key)?;
            store.trust_sign(&secret)?;
            println!("✓ staged root of trust signed");
        }
        TrustCommands::Stage { local_only: _, key } => {
            if let Some(path) = key {
                store.trust_sign(&SecretKey::load(&path)?)?;
            }
            store.trust_stage()?;
            println!("✓ staged root of trust is consistent");
        }
        TrustCommands::Apply { local_only: _, key } => {
            if let Some(path) = key {
                store.trust_sign(&SecretKey::load(&path)?)?;
            }
            let verifier = SignatureVerifier::with_keyring(repo.keyring()?);
            store.trust_apply(&verifier)?;
            println!("✓ root of trust applied");
        }
    }
    Ok(())
}

pub fn handle_policy(repo: &Repository, cmd: PolicyCommands) -> Result<()> {
    let store = PolicyStore::new(repo);
    match cmd {
        PolicyCommands::Init { key, policy_name } => {
            let secret = SecretKey::load(&key)?;
            store.policy_init(&policy_name)?;
            store.policy_sign(&policy_name, &secret)?;
            println!("✓ policy '{}' staged", policy_name);
        }
        PolicyCommands::AddKey {
            key,
            public_key,
            policy_name,
        } => {
            let secret = SecretKey::load(&key)?;
            let principal = principal_from_key_ref(&public_key)?;
            store.policy_add_principal(&policy_name, principal)?;
            store.policy_sign(&policy_name, &secret)?;
            println!("✓ key added to policy '{}'", policy_name);
        }
        PolicyCommands::AddPerson {
            key,
            person_id,
            public_keys,
            policy_name,
        } => {
            let secret = SecretKey::load(&key)?;
            let mut keys = Vec::new();
            for key_ref in &public_keys {
                keys.push(key_from_ref(key_ref)?);
            }
            let mut iter = keys.into_iter();
            let first = iter.next().ok_or_else(|| {
                Error::Validation(format!("person '{}' needs at least one key", person_id))
            })?;
            let mut principal = Principal::new(person_id.clone(), first);
            for key in iter {
                principal.add_key(key);
            }
            store.policy_add_principal(&policy_name, principal)?;
            store.policy_sign(&policy_name, &secret)?;
            println!("✓ person '{}' added to policy '{}'", person_id, policy_name);
        }
        PolicyCommands::AddRule {
            key,
            rule_name,
            rule_patterns,
            authorize,
            authorize_keys,
            threshold,
            policy_name,
        } => {
            let secret = SecretKey::load(&key)?;
            let patterns = parse_patterns(&rule_patterns)?;

            let mut authorized: std::collections::BTreeSet<String> =
                authorize.into_iter().collect();
            // Keys authorized directly become single-key principals named
            // by their key ID, added alongside the rule
            for key_ref in &authorize_keys {
                let principal = principal_from_key_ref(key_ref)?;
                authorized.insert(principal.id.clone());
                store.policy_add_principal(&policy_name, principal)?;
            }

            store.policy_add_rule(
                &policy_name,
                Rule {
                    name: rule_name.clone(),
                    patterns,
                    authorized,
                    threshold,
                },
            )?;
            store.policy_sign(&policy_name, &secret)?;
            println!("✓ rule '{}' staged in policy '{}'", rule_name, policy_name);
        }
        PolicyCommands::RemoveRule {
            key,
            rule_name,
            policy_name,
        } => {
            let secret = SecretKey::load(&key)?;
            store.policy_remove_rule(&policy_name, &rule_name)?;
            store.policy_sign(&policy_name, &secret)?;
            println!("✓ rule '{}' removed from policy '{}'", rule_name, policy_name);
        }
        PolicyCommands::Sign { key, policy_name } => {
            let secret = SecretKey::load(&key)?;
            store.policy_sign(&policy_name, &secret)?;
            println!("✓ staged policy '{}' signed", policy_name);
        }
        PolicyCommands::Stage {
            local_only: _,
            key,
            policy_name,
        } => {
            if let Some(path) = key {
                store.policy_sign(&policy_name, &SecretKey::load(&path)?)?;
            }
            store.policy_stage(&policy_name)?;
            println!("✓ staged policy '{}' is consistent", policy_name);
        }
        PolicyCommands::Apply {
            local_only: _,
            key,
            policy_name,
        } => {
            if let Some(path) = key {
                store.policy_sign(&policy_name, &SecretKey::load(&path)?)?;
            }
            let verifier = SignatureVerifier::with_keyring(repo.keyring()?);
            store.policy_apply(&policy_name, &verifier)?;
            println!("✓ policy '{}' applied", policy_name);
        }
        PolicyCommands::ListRules => {
            let rules = store.list_rules()?;
            if rules.is_empty() {
                println!("no applied rules");
            }
            for line in rules {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

pub fn handle_rsl(repo: &Repository, cmd: RslCommands) -> Result<()> {
    let log = ReferenceStateLog::new(repo);
    match cmd {
        RslCommands::Record {
            ref_name,
            local_only,
            key,
        } => {
            let secret = signing_key(repo, key)?;
            let opts = RecordOptions {
                local_only,
                ..RecordOptions::default()
            };
            let (id, entry) = log.record(&ref_name, &secret, &opts)?;
            println!("✓ recorded {} at entry {}", entry.ref_name, entry.index);
            println!("  entry: {}", id.to_hex());
            println!("  target: {}", entry.target.to_hex());
        }
        RslCommands::Propagate { timeout_secs } => {
            let opts = PropagateOptions {
                deadline: deadline_from(timeout_secs),
            };
            let summary = propagate(repo, &opts)?;
            for (name, copied) in summary.copied {
                println!("{}: {} entr{} copied", name, copied, if copied == 1 { "y" } else { "ies" });
            }
        }
        RslCommands::Show => {
            for (id, entry) in log.entries()? {
                let source = entry
                    .propagated_from
                    .as_deref()
                    .map(|s| format!(" (from {})", s))
                    .unwrap_or_default();
                println!(
                    "{} {} {} -> {}{}",
                    entry.index,
                    id.short(),
                    entry.ref_name,
                    entry.target.short(),
                    source
                );
            }
        }
    }
    Ok(())
}

pub fn handle_snapshot(repo: &Repository, cmd: SnapshotCommands) -> Result<()> {
    match cmd {
        SnapshotCommands::Create {
            ref_name,
            dir,
            message,
            key,
            approve_keys,
        } => {
            let secret = SecretKey::load(&key)?;
            let ref_name = refseal_core::canonical_ref_name(&ref_name);
            let parent = repo.read_ref(&ref_name)?;
            let files = refseal_core::snapshot_directory(repo, &dir)?;
            let mut snapshot = Snapshot::create(parent, files, message, Utc::now(), &secret)?;
            for approve_key in &approve_keys {
                snapshot.approve(&SecretKey::load(approve_key)?)?;
            }
            let id = repo.put_record(&snapshot)?;
            repo.update_ref(&ref_name, id, parent)?;
            println!("✓ {} -> {}", ref_name, id.to_hex());
        }
    }
    Ok(())
}

pub fn handle_key(cmd: KeyCommands) -> Result<()> {
    match cmd {
        KeyCommands::Generate { output } => {
            let secret = SecretKey::generate(&mut OsRng);
            let public = secret.public_key()?;
            std::fs::write(&output, secret.to_hex())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(&output)?.permissions();
                perms.set_mode(0o600);
                std::fs::set_permissions(&output, perms)?;
            }
            std::fs::write(output.with_extension("pub"), public.to_hex())?;
            println!("✓ key pair written to {}", output.display());
            println!("  key id: {}", public.key_id().to_hex());
        }
        KeyCommands::Id { key } => {
            let public = load_public_key(&key)?;
            println!("{}", public.key_id().to_hex());
        }
    }
    Ok(())
}

pub fn handle_keyring(repo: &Repository, cmd: KeyringCommands) -> Result<()> {
    match cmd {
        KeyringCommands::Add {
            fingerprint,
            public_key,
        } => {
            let mut keyring = repo.keyring()?;
            keyring.add(&fingerprint, load_public_key(&public_key)?);
            repo.save_keyring(&keyring)?;
            println!("✓ fingerprint {} registered", fingerprint);
        }
        KeyringCommands::List => {
            let keyring = repo.keyring()?;
            if keyring.entries.is_empty() {
                println!("keyring is empty");
            }
            for (fingerprint, key) in &keyring.entries {
                println!("{} -> {}", fingerprint, key.key_id().to_hex());
            }
        }
    }
    Ok(())
}

// ---- helpers ----

fn parse_patterns(raw: &[String]) -> Result<Vec<RulePattern>> {
    raw.iter().map(|s| RulePattern::parse(s)).collect()
}

fn load_public_key(path: &std::path::Path) -> Result<PublicKey> {
    let content = std::fs::read_to_string(path)?;
    PublicKey::from_hex(&content)
}

/// Resolve a key reference: `gpg:<fingerprint>` or a public key file path
fn key_from_ref(key_ref: &str) -> Result<Key> {
    if let Some(fingerprint) = key_ref.strip_prefix("gpg:") {
        return Ok(Key::from_fingerprint(fingerprint));
    }
    Ok(Key::from_public_key(load_public_key(std::path::Path::new(
        key_ref,
    ))?))
}

/// A single-key principal named by its key ID
fn principal_from_key_ref(key_ref: &str) -> Result<Principal> {
    let key = key_from_ref(key_ref)?;
    Ok(Principal::new(key.id.to_hex(), key))
}

fn principal_from_secret(secret: &SecretKey) -> Result<Principal> {
    let key = Key::from_public_key(secret.public_key()?);
    Ok(Principal::new(key.id.to_hex(), key))
}

/// Explicit key, or the repository's configured signing key
fn signing_key(repo: &Repository, key: Option<PathBuf>) -> Result<SecretKey> {
    match key {
        Some(path) => SecretKey::load(&path),
        None => {
            let config = repo.config()?;
            let path = config.signing_key.ok_or_else(|| {
                Error::Validation(
                    "no signing key given and none configured; pass -k or set one with `refseal config --signing-key`"
                        .to_string(),
                )
            })?;
            SecretKey::load(&path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_ref_parsing() {
        let key = key_from_ref("gpg:AB12CD34").unwrap();
        assert!(matches!(
            key.material,
            refseal_core::KeyMaterial::Fingerprint { .. }
        ));

        let dir = TempDir::new().unwrap();
        let secret = SecretKey::generate(&mut OsRng);
        let path = dir.path().join("alice.pub");
        std::fs::write(&path, secret.public_key().unwrap().to_hex()).unwrap();

        let key = key_from_ref(path.to_str().unwrap()).unwrap();
        assert_eq!(key.id, secret.key_id().unwrap());
    }

    #[test]
    fn test_parse_patterns_rejects_bad_scheme() {
        assert!(parse_patterns(&["nope:refs/heads/main".to_string()]).is_err());
        assert!(parse_patterns(&["ref:refs/heads/main".to_string()]).is_ok());
    }
}
