use std::cell::RefCell;
use std::time::{Duration, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(&cache.bytes);
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.update(SystemTime::now());
        cache
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now > self.next_update {
            self.update(now);
        }
    }

    fn update(&mut self, now: SystemTime) {
        let formatted = httpdate::fmt_http_date(now);
        debug_assert!(formatted.len() == DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(formatted.as_bytes());
        self.next_update = now + Duration::from_secs(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_len() {
        assert_eq!(DATE_VALUE_LENGTH, "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }

    #[test]
    fn renders_gmt_suffix() {
        let mut buf = Vec::new();
        extend(&mut buf);
        assert_eq!(buf.len(), DATE_VALUE_LENGTH);
        assert!(buf.ends_with(b" GMT"));
    }
}
