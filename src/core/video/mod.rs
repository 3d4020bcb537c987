pub mod frame;
pub mod source;

pub use frame::{luma, Frame, FrameInfo, RawFrame};
pub use source::{FrameListSource, Scene, ScenePattern, SyntheticSource, VideoSource};
