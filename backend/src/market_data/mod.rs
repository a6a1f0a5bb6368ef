pub mod bar;
pub mod kline_stream;
pub mod series;

pub use bar::Bar;
pub use kline_stream::BinanceKlineFeed;
pub use series::{SeriesReconciler, SeriesState};
