//! `parley-ai`
//!
//! **Responsibility:** boundary to the external chat-completion service.
//!
//! The rest of the system treats completion as text-in/text-out:
//! - it must not touch session state,
//! - it reports failures as a tagged [`CompletionError`] so the retry driver
//!   never has to guess whether a failure is worth retrying.

pub mod completion;
pub mod echo;
pub mod openai;

pub use completion::{CompletionError, CompletionReply, CompletionRequest, CompletionService};
pub use echo::EchoCompletionService;
pub use openai::{OpenAiCompatibleService, OpenAiConfig};
