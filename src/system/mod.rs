pub mod child_reaper;
pub mod exec;
pub mod no_suspend;
pub mod poll_table;
