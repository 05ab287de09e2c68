//! Thin OS shims. Everything unsafe in the crate lives in `sys`.

pub mod sys;
