//! Automatic spin-rate control.

pub mod auto;

pub use auto::{
    quantize_pressure, AutoControlConfig, AutoController, ControlDecision, DriveAdjustment,
};
