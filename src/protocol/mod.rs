//! Control protocol between source and sink devices

pub mod event;
pub mod message;

pub use event::{AudioEvent, AudioEventListener, AudioEventType};
pub use message::{
    parse_payload, random_task_code, ControlPayload, EnableRequest, PlayStatus, PlayStatusEvent,
    with_dh_id, RpcResult, VolumeEvent,
};
