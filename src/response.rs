use crate::types::HeaderList;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: usize,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl Response {
    #[must_use]
    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    /// The `:status` pseudo-header, parsed as a status code.
    ///
    /// # Panics
    /// Panics if the response has no `:status` header or it is not a valid
    /// number; a conforming peer always sends exactly one.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.header(":status")
            .expect("no :status pseudo-header in response")
            .parse()
            .expect(":status is not a valid number")
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
