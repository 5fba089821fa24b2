//! Outbound request header construction.

use crate::codec::Header;
use crate::metadata::Metadata;

/// Identifies the RPC method a stream carries.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
}

impl MethodDescriptor {
    /// Create a descriptor for the given fully qualified method name,
    /// e.g. `package.Service/Method`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The fully qualified method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The request `:path`, the method name with a leading slash.
    pub fn path(&self) -> String {
        format!("/{}", self.name)
    }
}

const USER_AGENT: &str = concat!("grpc-transport/", env!("CARGO_PKG_VERSION"));

/// Build the outbound header block for a new request stream.
///
/// Pseudo-headers come first, then the fixed gRPC headers, then the caller's
/// metadata with reserved keys filtered out.
pub fn create_request_headers(metadata: &Metadata, path: &str, authority: &str) -> Vec<Header> {
    let mut headers = vec![
        Header::new(":method", "POST"),
        Header::new(":scheme", "https"),
        Header::new(":path", path),
        Header::new(":authority", authority),
        Header::new("content-type", "application/grpc"),
        Header::new("te", "trailers"),
        Header::new("user-agent", USER_AGENT),
    ];

    for (key, value) in metadata.iter() {
        if is_reserved(key) {
            continue;
        }
        headers.push(Header::new(key.as_bytes(), value.as_bytes()));
    }

    headers
}

fn is_reserved(key: &str) -> bool {
    key.starts_with(':') || key == "content-type" || key == "te" || key == "user-agent"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
        headers
            .iter()
            .find(|h| h.name == name.as_bytes())
            .map(|h| h.value.as_slice())
    }

    #[test]
    fn test_method_descriptor_path() {
        let method = MethodDescriptor::new("echo.Echo/UnaryEcho");
        assert_eq!(method.name(), "echo.Echo/UnaryEcho");
        assert_eq!(method.path(), "/echo.Echo/UnaryEcho");
    }

    #[test]
    fn test_request_headers_pseudo_headers() {
        let headers = create_request_headers(&Metadata::new(), "/svc/method", "example.com:443");
        assert_eq!(header_value(&headers, ":method"), Some(&b"POST"[..]));
        assert_eq!(header_value(&headers, ":scheme"), Some(&b"https"[..]));
        assert_eq!(header_value(&headers, ":path"), Some(&b"/svc/method"[..]));
        assert_eq!(
            header_value(&headers, ":authority"),
            Some(&b"example.com:443"[..])
        );
    }

    #[test]
    fn test_request_headers_fixed_headers() {
        let headers = create_request_headers(&Metadata::new(), "/svc/method", "a:1");
        assert_eq!(
            header_value(&headers, "content-type"),
            Some(&b"application/grpc"[..])
        );
        assert_eq!(header_value(&headers, "te"), Some(&b"trailers"[..]));
        assert!(header_value(&headers, "user-agent").is_some());
    }

    #[test]
    fn test_request_headers_pseudo_headers_first() {
        let mut metadata = Metadata::new();
        metadata.insert("x-custom", "v");
        let headers = create_request_headers(&metadata, "/svc/method", "a:1");
        let first_regular = headers
            .iter()
            .position(|h| !h.name.starts_with(b":"))
            .unwrap();
        assert!(
            headers[first_regular..]
                .iter()
                .all(|h| !h.name.starts_with(b":"))
        );
    }

    #[test]
    fn test_request_headers_filters_reserved() {
        let mut metadata = Metadata::new();
        metadata.insert(":authority", "spoofed");
        metadata.insert("te", "gzip");
        metadata.insert("content-type", "text/plain");
        metadata.insert("x-custom", "kept");
        let headers = create_request_headers(&metadata, "/svc/method", "real:443");

        assert_eq!(header_value(&headers, ":authority"), Some(&b"real:443"[..]));
        assert_eq!(header_value(&headers, "te"), Some(&b"trailers"[..]));
        assert_eq!(
            header_value(&headers, "content-type"),
            Some(&b"application/grpc"[..])
        );
        assert_eq!(header_value(&headers, "x-custom"), Some(&b"kept"[..]));
    }
}
