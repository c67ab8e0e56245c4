pub mod crsf_task;
pub mod fast_loop;
pub mod link_task;
pub mod telemetry_task;
