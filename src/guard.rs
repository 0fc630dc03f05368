//! 上传凭据校验：常量时间比较与失败延迟。

use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// 携带上传凭据的请求头。
pub const API_KEY_HEADER: &str = "x-api-key";

/// 以常量时间比较两段字节，耗时与匹配前缀长度无关。
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// 无状态的凭据校验器。
pub struct AccessGuard {
    secret: String,
    reject_delay: Duration,
}

impl fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGuard")
            .field("secret", &"<redacted>")
            .field("reject_delay", &self.reject_delay)
            .finish()
    }
}

impl AccessGuard {
    pub fn new(secret: String, reject_delay: Duration) -> Self {
        Self {
            secret,
            reject_delay,
        }
    }

    pub fn verify(&self, presented: &str) -> bool {
        constant_time_eq(presented.as_bytes(), self.secret.as_bytes())
    }

    /// 拒绝分支上的固定延迟。
    pub async fn delay_rejection(&self) {
        if !self.reject_delay.is_zero() {
            tokio::time::sleep(self.reject_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn differing_inputs_do_not_match() {
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[test]
    fn verify_rejects_everything_but_the_secret() {
        let guard = AccessGuard::new(SECRET.to_string(), Duration::ZERO);
        assert!(guard.verify(SECRET));
        for candidate in [
            "",
            "0",
            "0123456789abcdef0123456789abcde",
            "0123456789abcdef0123456789abcdeF",
            "0123456789abcdef0123456789abcdef0",
            "x123456789abcdef0123456789abcdef",
        ] {
            assert!(!guard.verify(candidate), "accepted {candidate:?}");
        }
    }

    #[tokio::test]
    async fn rejection_delay_is_applied() {
        let guard = AccessGuard::new(SECRET.to_string(), Duration::from_millis(40));
        let started = Instant::now();
        guard.delay_rejection().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn debug_output_hides_secret() {
        let guard = AccessGuard::new(SECRET.to_string(), Duration::ZERO);
        assert!(!format!("{guard:?}").contains(SECRET));
    }
}
