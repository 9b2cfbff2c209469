//! Security analysis engines for Guardmesh.
//!
//! This crate implements the request-path validation pipeline:
//!
//! 1. [`rules::RegexFilter`] — hard-coded regex rules, the fast first line
//!    of defence.
//! 2. [`matcher::PatternMatcher`] — fuzzy similarity lookup against the
//!    learned pattern store.
//! 3. [`guardian::GuardianValidator`] — an external validator model behind
//!    the [`guardian::LanguageModel`] seam.
//! 4. [`parser`] — fail-closed parsing of the model's reply.
//!
//! [`pipeline::ValidationPipeline`] orchestrates the stages and publishes
//! attack records for every block it issues.

pub mod guardian;
pub mod matcher;
pub mod normalise;
pub mod parser;
pub mod pipeline;
pub mod rules;

pub use guardian::{GuardianValidator, HttpLanguageModel, LanguageModel};
pub use matcher::{MatchOutcome, PatternMatcher, SimilarMatch};
pub use parser::{parse_guardian_reply, GuardianReply, ParseRejection};
pub use pipeline::ValidationPipeline;
pub use rules::{RegexFilter, RuleVerdict};
