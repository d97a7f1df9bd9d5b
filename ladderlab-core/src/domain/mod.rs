//! Domain types for LadderLab

pub mod bar;
pub mod instrument;
pub mod ladder;

pub use bar::{date_key, link_previous_close, parse_date_key, sort_canonical, DailyBar, DATE_FORMAT};
pub use instrument::{is_st_name, BoardCategory, Exchange, Instrument, InstrumentError};
pub use ladder::{BoardPattern, ConceptTags, LimitUpRecord, PromotionRate};
