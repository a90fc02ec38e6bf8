pub mod actuator;

pub use actuator::{ActuatorModel, ActuatorProfile, ActuatorProfileRegistry};
