//! Data acquisition, validation and storage

pub mod circuit_breaker;
pub mod composite;
pub mod eastmoney;
pub mod pool;
pub mod primary;
pub mod provider;
pub mod session;
pub mod storage;
pub mod universe;
pub mod validate;
pub mod wire;

pub use circuit_breaker::CircuitBreaker;
pub use composite::{
    plan_fetch, CompositeConfig, CompositeFetcher, FetchFailure, FetchMode, FetchOutcome,
    FetchTask,
};
pub use eastmoney::{EastmoneyConfig, EastmoneySource};
pub use pool::{SessionLease, SessionPool, TeardownReport};
pub use primary::{PrimaryFetcher, RetryPolicy};
pub use provider::{
    next_weekday_after, weekday_on_or_before, BarSource, CancelToken, DataError, DataSource,
    DateRange, FetchResult, InstrumentSource, RawBar, TagSource,
};
pub use session::{QuoteSession, SessionFactory, TdxConfig, TdxSession, TdxSessionFactory};
pub use storage::{
    bars_frame, keep_stored_names, merge_bars, merge_tags, Coverage, ParquetStorage, SaveMode,
    SaveOutcome, Storage, StorageError, StorageMeta, TableMeta,
};
pub use universe::{Universe, UniverseEntry, UniverseError};
pub use validate::{Severity, ValidationConfig, ValidationReport, Validator, Violation, ViolationKind};
