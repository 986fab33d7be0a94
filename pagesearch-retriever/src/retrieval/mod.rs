pub mod indexer;
pub mod indexing_engine;
pub mod task_queue;
