mod format;
mod progress;
mod status;

pub use format::{format_bytes, format_duration, format_timestamp_ms, format_u64_commas};

pub use progress::{bounded_bar, spinner_bar};

pub use status::{print_command_status, CommandStatus};
