//! Refseal Policy - Root-of-trust and policy documents
//!
//! Implements the staged sign-then-apply lifecycle for the trust anchor
//! and the tree of policy documents delegated from it.

pub mod document;
pub mod draft;
pub mod root;
pub mod store;

pub use document::{PolicyDocument, Rule, TOP_LEVEL_POLICY};
pub use draft::{
    apply_draft, count_valid_signatures, document_payload, AppliedDocument, Document, Draft,
    SignerRequirement,
};
pub use root::{GlobalRule, RepositoryLink, RootOfTrust};
pub use store::PolicyStore;
