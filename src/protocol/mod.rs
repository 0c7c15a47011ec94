mod codec;
mod command;
mod types;

pub use codec::RespCodec;
pub use command::Command;
pub use types::RespValue;
