pub mod state;
pub mod work;
pub mod deferred;
pub mod throttle;

pub use deferred::Deferred;
pub use state::{Admission, ThrottleSnapshot, ThrottleState};
pub use throttle::{make_throttled, Callable, Throttle};
pub use work::Work;
