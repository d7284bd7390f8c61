use crate::h2::consts::*;
use crate::types::{ConnectionConfig, ProtocolError};

/// One side's SETTINGS values (RFC 7540 Section 6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

/// What applying a peer SETTINGS frame changed that the connection has to act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDelta {
    /// New initial window minus the previous one.
    pub window_delta: i64,
    pub header_table_size: Option<u32>,
}

impl Default for Settings {
    /// Protocol defaults, in effect until the peer's SETTINGS arrive.
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    pub fn local(config: &ConnectionConfig) -> Self {
        Self {
            header_table_size: config.header_table_size,
            enable_push: config.enable_push,
            max_concurrent_streams: Some(config.max_concurrent_streams),
            initial_window_size: config.initial_window_size.min(MAX_WINDOW_SIZE),
            max_frame_size: config
                .max_frame_size
                .clamp(MAX_FRAME_SIZE_LOWER_BOUND, MAX_FRAME_SIZE_UPPER_BOUND),
            max_header_list_size: Some(config.max_header_list_size),
        }
    }

    /// Entries for the SETTINGS frame of the connection preface.
    pub fn entries(&self) -> Vec<(u16, u32)> {
        let mut entries = vec![
            (SETTINGS_HEADER_TABLE_SIZE, self.header_table_size),
            (SETTINGS_ENABLE_PUSH, self.enable_push as u32),
        ];
        if let Some(max) = self.max_concurrent_streams {
            entries.push((SETTINGS_MAX_CONCURRENT_STREAMS, max));
        }
        entries.push((SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size));
        entries.push((SETTINGS_MAX_FRAME_SIZE, self.max_frame_size));
        if let Some(max) = self.max_header_list_size {
            entries.push((SETTINGS_MAX_HEADER_LIST_SIZE, max));
        }
        entries
    }

    /// Validates and applies the entries of a peer SETTINGS frame in order.
    pub fn apply(&mut self, entries: &[(u16, u32)]) -> Result<SettingsDelta, ProtocolError> {
        let mut delta = SettingsDelta::default();

        for &(id, value) in entries {
            match id {
                SETTINGS_HEADER_TABLE_SIZE => {
                    self.header_table_size = value;
                    delta.header_table_size = Some(value);
                }
                SETTINGS_ENABLE_PUSH => match value {
                    0 => self.enable_push = false,
                    1 => self.enable_push = true,
                    _ => {
                        return Err(ProtocolError::protocol(format!(
                            "Invalid ENABLE_PUSH value {}",
                            value
                        )))
                    }
                },
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    self.max_concurrent_streams = Some(value);
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(ProtocolError::flow_control(format!(
                            "Invalid INITIAL_WINDOW_SIZE value {}",
                            value
                        )));
                    }
                    delta.window_delta += value as i64 - self.initial_window_size as i64;
                    self.initial_window_size = value;
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(MAX_FRAME_SIZE_LOWER_BOUND..=MAX_FRAME_SIZE_UPPER_BOUND).contains(&value) {
                        return Err(ProtocolError::protocol(format!(
                            "Invalid MAX_FRAME_SIZE value {}",
                            value
                        )));
                    }
                    self.max_frame_size = value;
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => {
                    self.max_header_list_size = Some(value);
                }
                _ => {
                    // Unknown settings are ignored per RFC 7540
                }
            }
        }

        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::H2ErrorCode;

    #[test]
    fn applies_window_delta() {
        let mut settings = Settings::default();
        let delta = settings
            .apply(&[(SETTINGS_INITIAL_WINDOW_SIZE, 1_000)])
            .unwrap();
        assert_eq!(delta.window_delta, 1_000 - DEFAULT_INITIAL_WINDOW_SIZE as i64);
        assert_eq!(settings.initial_window_size, 1_000);
    }

    #[test]
    fn rejects_oversized_initial_window() {
        let mut settings = Settings::default();
        let err = settings
            .apply(&[(SETTINGS_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE + 1)])
            .unwrap_err();
        assert_eq!(err.error_code(), H2ErrorCode::FlowControlError);
    }

    #[test]
    fn rejects_invalid_push_flag_and_frame_size() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.apply(&[(SETTINGS_ENABLE_PUSH, 2)]).unwrap_err().error_code(),
            H2ErrorCode::ProtocolError
        );
        assert_eq!(
            settings.apply(&[(SETTINGS_MAX_FRAME_SIZE, 100)]).unwrap_err().error_code(),
            H2ErrorCode::ProtocolError
        );
    }

    #[test]
    fn ignores_unknown_identifiers() {
        let mut settings = Settings::default();
        let before = settings;
        settings.apply(&[(0xff, 7)]).unwrap();
        assert_eq!(settings, before);
    }

    #[test]
    fn local_entries_reflect_config() {
        let config = ConnectionConfig::default().with_push(true);
        let entries = Settings::local(&config).entries();
        assert!(entries.contains(&(SETTINGS_ENABLE_PUSH, 1)));
        assert!(entries.contains(&(SETTINGS_INITIAL_WINDOW_SIZE, config.initial_window_size)));
    }
}
