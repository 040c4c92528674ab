//! Out-of-band proof of submitted contact fields.
//!
//! Two mechanisms live here: the token sequencer, which walks the profile's
//! verified fields one at a time dispatching one-time codes, and the remote
//! verifier trait for pluggable external identity-proofing backends.

pub mod remote;
pub mod sequencer;

pub use remote::{RemoteOutcome, RemotePrompt, RemoteVerificationState, RemoteVerifier};
pub use sequencer::VerificationSequencer;
