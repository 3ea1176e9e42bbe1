pub use job_schedule::JobSchedule;

mod job_schedule;
