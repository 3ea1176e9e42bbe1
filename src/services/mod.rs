mod generatorservice;
mod jobgenerator;
mod jobrunner;
mod jobstore;
mod workerservice;

pub use generatorservice::GeneratorService;
pub use jobgenerator::{GenerationReport, JobGenerator};
pub use jobrunner::TaskDispatcher;
pub use jobstore::JobStore;
pub use workerservice::WorkerService;
