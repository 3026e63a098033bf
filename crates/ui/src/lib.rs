#![deny(unsafe_code)]

//! Desktop chat client built with GPUI and gpui-component.

/// Window shell, sidebar layout and shell-level actions.
pub mod app;
pub mod chat;
pub mod theme;
