pub mod controller;
pub mod models;
pub mod parameters;
pub mod pedal;
pub mod settings;
pub mod tuner;
