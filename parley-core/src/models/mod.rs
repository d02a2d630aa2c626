pub mod chunk;
pub mod document;
pub mod prompt;
pub mod turn;

pub use chunk::{IndexedChunk, Passage};
pub use document::{ClaimedDocument, ImportedDocument};
pub use prompt::PromptRevision;
pub use turn::{ConversationTurn, Role};
