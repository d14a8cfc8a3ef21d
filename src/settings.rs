//! Connection settings (§3 "Connection settings"): one record per direction,
//! with the deltas SETTINGS application must propagate into flow control.
use crate::error::H2Error;
use crate::types::{
    SettingsParameter, DEFAULT_ENABLE_PUSH, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: DEFAULT_ENABLE_PUSH == 1,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl ConnectionSettings {
    /// Client defaults advertised in the first, locally originated SETTINGS
    /// frame: push disabled, since this engine never delivers PUSH_PROMISE.
    #[must_use]
    pub fn client_defaults() -> Self {
        Self {
            enable_push: false,
            ..Self::default()
        }
    }

    pub fn as_params(&self) -> Vec<(SettingsParameter, u32)> {
        let mut params = vec![
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, u32::from(self.enable_push)),
            (SettingsParameter::InitialWindowSize, self.initial_window_size),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
        ];
        if let Some(max) = self.max_concurrent_streams {
            params.push((SettingsParameter::MaxConcurrentStreams, max));
        }
        if let Some(max) = self.max_header_list_size {
            params.push((SettingsParameter::MaxHeaderListSize, max));
        }
        params
    }

    /// Applies received parameters in order. Returns the
    /// `initial_window_size` delta (new - old) when it changed, so the
    /// caller can apply it atomically to every open stream's send window.
    pub fn apply(&mut self, params: &[(SettingsParameter, u32)]) -> Result<Option<i64>, H2Error> {
        let mut window_delta = None;
        for &(param, value) in params {
            match param {
                SettingsParameter::HeaderTableSize => self.header_table_size = value,
                SettingsParameter::EnablePush => {
                    if value > 1 {
                        return Err(H2Error::Protocol("SETTINGS_ENABLE_PUSH must be 0 or 1"));
                    }
                    self.enable_push = value == 1;
                }
                SettingsParameter::MaxConcurrentStreams => {
                    self.max_concurrent_streams = Some(value);
                }
                SettingsParameter::InitialWindowSize => {
                    if i64::from(value) > MAX_WINDOW_SIZE {
                        return Err(H2Error::flow_control(
                            true,
                            "SETTINGS_INITIAL_WINDOW_SIZE exceeds 2^31-1",
                        ));
                    }
                    window_delta = Some(i64::from(value) - i64::from(self.initial_window_size));
                    self.initial_window_size = value;
                }
                SettingsParameter::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(H2Error::Protocol(
                            "SETTINGS_MAX_FRAME_SIZE out of legal range",
                        ));
                    }
                    self.max_frame_size = value;
                }
                SettingsParameter::MaxHeaderListSize => {
                    self.max_header_list_size = Some(value);
                }
            }
        }
        Ok(window_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_window_size_delta_reported() {
        let mut settings = ConnectionSettings::default();
        let delta = settings
            .apply(&[(SettingsParameter::InitialWindowSize, 100)])
            .unwrap();
        assert_eq!(delta, Some(100 - i64::from(DEFAULT_INITIAL_WINDOW_SIZE)));
    }

    #[test]
    fn rejects_oversize_initial_window() {
        let mut settings = ConnectionSettings::default();
        assert!(settings
            .apply(&[(SettingsParameter::InitialWindowSize, u32::MAX)])
            .is_err());
    }

    #[test]
    fn rejects_out_of_range_max_frame_size() {
        let mut settings = ConnectionSettings::default();
        assert!(settings
            .apply(&[(SettingsParameter::MaxFrameSize, 100)])
            .is_err());
    }

    #[test]
    fn client_defaults_disable_push() {
        assert!(!ConnectionSettings::client_defaults().enable_push);
    }
}
