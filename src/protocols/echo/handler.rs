//! Request processing between frame decode and frame encode.

use std::borrow::Cow;

/// Application logic plugged into the event loop.
///
/// Called once per decoded request, in arrival order, on the loop thread.
/// Must not block.
pub trait Service {
    /// Produce the response payload for one request payload.
    fn process<'a>(&mut self, request: &'a [u8]) -> Cow<'a, [u8]>;
}

/// Responds with the request payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Service for Echo {
    fn process<'a>(&mut self, request: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_borrows_request() {
        let mut echo = Echo;
        let response = echo.process(b"hello");
        assert_eq!(&*response, b"hello");
        assert!(matches!(response, Cow::Borrowed(_)));
    }
}
