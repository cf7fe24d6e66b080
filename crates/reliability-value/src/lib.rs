mod interval;
mod pbox;
mod scalar;
mod value;

pub use interval::Interval;
pub use pbox::PBox;
pub use scalar::Scalar;
pub use value::Value;
