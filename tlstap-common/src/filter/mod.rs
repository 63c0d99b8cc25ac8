//! Forwarding decisions made on each chunk before it is exported.

pub mod card;
pub mod http;

use crate::{FilterConfig, POLICY_CARD_NUMBER, POLICY_HTTP_CLOUD_HOST};

pub use card::detect_card_number;
pub use http::{HttpCloudHostFilter, RequestHeaders};

pub trait ContentFilter {
    fn should_forward(&mut self, fragment: &[u8]) -> bool;
}

/// Forwards everything.
pub struct PassThrough;

impl ContentFilter for PassThrough {
    fn should_forward(&mut self, _fragment: &[u8]) -> bool {
        true
    }
}

pub struct CardNumberFilter;

impl ContentFilter for CardNumberFilter {
    fn should_forward(&mut self, fragment: &[u8]) -> bool {
        detect_card_number(fragment)
    }
}

/// Applies the detectors enabled in a `FilterConfig`. A chunk is forwarded
/// when any enabled detector accepts it; with no detector enabled every
/// chunk is forwarded.
pub struct PolicyFilter<'a> {
    config: FilterConfig,
    http: HttpCloudHostFilter<'a>,
}

impl<'a> PolicyFilter<'a> {
    pub fn new(config: FilterConfig, headers: &'a mut RequestHeaders) -> Self {
        let http = HttpCloudHostFilter::new(headers, config.header_len_mode());
        Self { config, http }
    }
}

impl ContentFilter for PolicyFilter<'_> {
    #[inline(always)]
    fn should_forward(&mut self, fragment: &[u8]) -> bool {
        if self.config.policies == 0 {
            return true;
        }
        if self.config.has(POLICY_HTTP_CLOUD_HOST) && self.http.should_forward(fragment) {
            return true;
        }
        self.config.has(POLICY_CARD_NUMBER) && detect_card_number(fragment)
    }
}
