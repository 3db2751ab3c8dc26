pub mod acl;
pub mod codec;
pub mod crypt;
pub mod frame;
pub mod throttle;

pub use codec::{ClientCodec, FrameError, Protocol};
pub use crypt::{CipherCursor, CipherKey, CipherStream};
pub use frame::{Frame, FrameBuilder, FrameReader};
