//! Storage layer: Redis hot path, persistence lanes, repository seams

mod queue;
mod redis_sink;
mod redis_writer;
mod repository;

pub use queue::{
    CommStatsTask, MemoryPersistenceSink, NullPersistenceSink, PersistenceQueue,
    PersistenceQueueStats, PersistenceSink, PersistenceTask,
};
pub use redis_sink::{MemorySink, RedisConnection, RedisError, RedisSink};
pub use redis_writer::RedisDataWriter;
pub use repository::{
    AlarmOccurrenceRepository, AlarmRuleRepository, CurrentValueRepository, EdgeServer,
    EdgeServerRepository, MemoryAlarmRuleRepository, MemoryCurrentValueRepository,
    MemoryEdgeServerRepository, MemoryOccurrenceRepository, MemoryTargetRepository,
    MemoryVirtualPointRepository, PayloadTemplateRow, RepositoryError, SiteMappingRow,
    TargetLoadData, TargetMappingRow, TargetRepository, VirtualPointRepository,
};
