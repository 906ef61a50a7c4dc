use bytes::Bytes;
use std::sync::Arc;

/// Application logic turning one request payload into a reply
///
/// A single handler is shared by every stream of every connection and may
/// be called concurrently from worker threads, never from a loop thread.
/// `Ok(None)` means no reply is sent for this payload.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, payload: Bytes) -> anyhow::Result<Option<Bytes>>;
}

impl<F> Handler for F
where
    F: Fn(Bytes) -> anyhow::Result<Option<Bytes>> + Send + Sync + 'static,
{
    fn handle(&self, payload: Bytes) -> anyhow::Result<Option<Bytes>> {
        self(payload)
    }
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle(&self, payload: Bytes) -> anyhow::Result<Option<Bytes>> {
        (**self).handle(payload)
    }
}

/// Replies with the request payload unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Handler for Echo {
    fn handle(&self, payload: Bytes) -> anyhow::Result<Option<Bytes>> {
        Ok(Some(payload))
    }
}

/// Infallible byte transform that always replies
#[derive(Clone)]
pub struct Transform<F>(F);

/// Wrap an infallible `&[u8] -> Vec<u8>` function as a handler
pub fn transform<F>(f: F) -> Transform<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    Transform(f)
}

impl<F> Handler for Transform<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn handle(&self, payload: Bytes) -> anyhow::Result<Option<Bytes>> {
        Ok(Some(Bytes::from((self.0)(&payload))))
    }
}

/// Replies with the payload in ASCII upper case
pub fn uppercase() -> Transform<fn(&[u8]) -> Vec<u8>> {
    Transform(<[u8]>::to_ascii_uppercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo() {
        let reply = Echo.handle(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(reply, Some(Bytes::from_static(b"hi")));
    }

    #[test]
    fn test_closure_handler() {
        let silent = |_: Bytes| -> anyhow::Result<Option<Bytes>> { Ok(None) };
        assert_eq!(silent.handle(Bytes::from_static(b"x")).unwrap(), None);

        let failing = |_: Bytes| -> anyhow::Result<Option<Bytes>> { anyhow::bail!("rejected") };
        assert_eq!(failing.handle(Bytes::new()).unwrap_err().to_string(), "rejected");
    }

    #[test]
    fn test_uppercase_transform() {
        let handler: Arc<dyn Handler> = Arc::new(uppercase());
        let reply = handler.handle(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(reply, Some(Bytes::from_static(b"ABC")));
    }

    #[test]
    fn test_transform_of_empty_payload() {
        let reversed = transform(|payload| payload.iter().rev().copied().collect());
        assert_eq!(reversed.handle(Bytes::new()).unwrap(), Some(Bytes::new()));
        assert_eq!(
            reversed.handle(Bytes::from_static(b"abc")).unwrap(),
            Some(Bytes::from_static(b"cba"))
        );
    }
}
