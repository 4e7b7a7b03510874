#![deny(dead_code)]
#![deny(unused_imports)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distribution;
pub mod estimate;
pub mod index;
pub mod influence;
pub mod jackknife;
pub mod loocv;
pub mod model;
pub mod out_of_sample;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod simulate;
pub mod stats;
pub mod threshold;
pub mod warm_start;
pub mod weights;
