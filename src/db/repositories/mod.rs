pub mod alerts;
pub mod cameras;
pub mod logs;

pub use alerts::AlertsRepository;
pub use cameras::CamerasRepository;
pub use logs::LogsRepository;
