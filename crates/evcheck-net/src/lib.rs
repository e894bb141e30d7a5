pub mod attacker;
pub mod codec;
pub mod receiver;
pub mod targeter;

pub use attacker::{run_attack, AttackPlan, HttpLoadGenerator, DEFAULT_WORKERS};
pub use codec::{JsonEventCodec, STRUCTURED_CONTENT_TYPE};
pub use receiver::{FaultInjection, Receiver, ReceiverSettings};
pub use targeter::{EventTargeter, EVENT_ID_HEADER};
