mod event_time;

pub use event_time::EventTime;
