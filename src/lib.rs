//! AcouTest drives audio test procedures on Android devices through `adb`, `tinycap`
//! and `tinyplay`. [`app::commands`] is the surface a front end binds to; the
//! `acoutest` binary is one such front end.

pub mod app;
