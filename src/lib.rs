//! handoff — capture AI coding agent sessions and build token-budgeted
//! resume prompts another agent can pick up.
//!
//! Pipeline: adapter → analyzer → enrichment → compression → prompt.
//! Adapters normalize each assistant's native storage into a
//! [`model::CanonicalSession`]; the analyzer distills task state from the
//! chat; enrichment adds project surroundings; the compression engine packs
//! prioritized layers into a token budget; the prompt builder assembles the
//! final Markdown hand-off. The watcher polls adapters and flags sessions
//! that have plausibly hit a rate limit.

pub mod adapters;
pub mod analyzer;
pub mod compress;
pub mod enrich;
pub mod error;
pub mod model;
pub mod paths;
pub mod prompt;
pub mod registry;
pub mod store;
pub mod validate;
pub mod watcher;
