#![allow(dead_code)]

pub mod mirror_pair;
pub mod resync_rig;
