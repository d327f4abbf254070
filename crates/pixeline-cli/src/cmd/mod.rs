pub mod publish;
pub mod worker;

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use pixeline_core::ConnectionError;

/// Whether `err` is a start-up connection abandoned because of a signal
pub fn interrupted_at_startup(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConnectionError>()
        .is_some_and(ConnectionError::is_cancelled)
}

/// Two-column settings table
pub fn settings_table(title: &str, rows: &[(&str, String)]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new(title).fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    for (label, value) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_interruption_is_recognised() {
        let cancelled = anyhow::Error::new(ConnectionError::cancelled("Redis", 1));
        let exhausted = anyhow::Error::new(ConnectionError::new("Redis", 7, "refused"));
        assert!(interrupted_at_startup(&cancelled));
        assert!(!interrupted_at_startup(&exhausted));
        assert!(!interrupted_at_startup(&anyhow::anyhow!("other")));
    }
}
