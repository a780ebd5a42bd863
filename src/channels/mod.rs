pub mod slack;
pub mod traits;

pub use slack::{verify_slack_signature, SignatureError, SlackChannel, SlackEnvelope, SlackEvent};
pub use traits::{
    HistoryMessage, InboundEvent, MentionEvent, ThreadChannel, ThreadMessageEvent,
};
