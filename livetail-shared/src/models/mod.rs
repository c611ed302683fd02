pub mod chat;
pub mod filter;
pub mod frames;
pub mod records;

pub use chat::{
    AbortResponse, Attachment, ChatFrame, GenerationRequest, MessageRole, MessageState,
    MessagesResponse, StepEvent, StepStatus,
};
pub use filter::{PageError, PageRequest, TailFilter, TailQuery};
pub use frames::{ControlFrame, DeliveryClass, EventFrame, TailFrame};
pub use records::{
    ChangeEvent, ChangeOperation, ConversationSummary, LogRecord, TailKind, TailRecord,
};
