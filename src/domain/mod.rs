pub mod buttons;
pub mod models;
pub mod settings;
