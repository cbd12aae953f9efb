//! Header-block serialization (design §4.2).

use crate::http::message::{Request, Response};

fn push_header_line(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

pub fn serialize_request(req: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + req.headers.total_size());
    out.extend_from_slice(req.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(&req.url);
    out.push(b' ');
    out.extend_from_slice(req.proto.as_str().as_bytes());
    out.extend_from_slice(b"\r\n");
    for h in req.headers.iter() {
        push_header_line(&mut out, &h.name, &h.value);
    }
    push_header_line(
        &mut out,
        b"Connection",
        if req.keep_alive { b"Keep-Alive" } else { b"Close" },
    );
    out.extend_from_slice(b"\r\n");
    out
}

pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + resp.headers.total_size());
    out.extend_from_slice(resp.proto.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(resp.code.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(resp.reason.as_bytes());
    out.extend_from_slice(b"\r\n");
    for h in resp.headers.iter() {
        push_header_line(&mut out, &h.name, &h.value);
    }
    // A CONNECT tunnel's 200 response carries no Connection framing header.
    if !resp.is_tunnel {
        push_header_line(
            &mut out,
            b"Connection",
            if resp.keep_alive { b"Keep-Alive" } else { b"Close" },
        );
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::HeaderList;
    use crate::http::message::{Method, Proto};

    #[test]
    fn serializes_request_with_connection_header() {
        let headers = HeaderList::new();
        let req = Request::new(Method::Get, b"/".to_vec(), Proto::Http11, headers).unwrap();
        let bytes = serialize_request(&req);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Connection: Keep-Alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn connect_response_has_no_connection_header() {
        let resp = Response::connect_established();
        let bytes = serialize_response(&resp);
        assert_eq!(bytes, b"HTTP/1.0 200 Connection Established\r\n\r\n".to_vec());
    }
}
