//! Certified randomness: OS entropy, commit-reveal and draw orders

pub mod commit_reveal;
pub mod draw_order;
pub mod secure;

pub use commit_reveal::{commit_hash, verify_commitment, CommitRevealProtocol, CommitState, Commitment, Reveal};
pub use draw_order::{seed_fingerprint, DrawOrder, DrawOrderGenerator};
pub use secure::{EntropySource, OsEntropy, SecureRandomSource};
