//! The request echo page, and the CGI meta-variables it lists.

use std::collections::HashMap;
use std::net::SocketAddr;

use hyper::{
    header::{HeaderValue, CONTENT_TYPE, HOST, SERVER},
    http::request::Parts,
    Body, HeaderMap, Request, Response,
};
use indexmap::IndexMap;
use tracing::debug;

use crate::http_util::internal_error;
use crate::request::{RequestContext, RequestGlobalContext};
use crate::version::{CGI_VERSION, SERVER_SOFTWARE_VERSION};

const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const PAGE_TITLE: &str = "Request Echo";

/// Answer a request with an HTML page listing its server variables, query
/// parameters, and form parameters.
///
/// There are no error conditions beyond a failed body read: absent query
/// strings and bodies simply produce empty listings.
pub async fn handle(
    req: Request<Body>,
    request_context: &RequestContext,
    global_context: &RequestGlobalContext,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(data) => data.to_vec(),
        Err(e) => return internal_error(format!("Failed to read request body: {}", e)),
    };

    let variables = server_variables(
        &parts,
        body.len(),
        request_context.client_addr,
        global_context.default_host.as_str(),
        global_context.use_tls,
        &global_context.global_env_vars,
    );
    let query = query_params(&parts.uri);
    let form = form_params(&parts.headers, &body);

    let page = render_page(&variables, &query, &form);

    let mut res = Response::new(Body::from(page));
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
    res.headers_mut()
        .insert(SERVER, HeaderValue::from_static(SERVER_SOFTWARE_VERSION));
    res
}

/// Build the CGI meta-variables for the Server Variables section.
fn server_variables(
    req: &Parts,
    content_length: usize,
    client_addr: SocketAddr,
    default_host: &str,
    use_tls: bool,
    environment: &HashMap<String, String>,
) -> IndexMap<String, String> {
    let (host, port) = parse_host_header_uri(&req.headers, &req.uri, default_host);

    // Note that we put these first so that there is no chance that they
    // overwrite the built-in vars. IMPORTANT: This is also why some values
    // have empty strings deliberately set (as opposed to omitting the pair
    // altogether).
    let mut variables: IndexMap<String, String> = IndexMap::new();
    let mut injected: Vec<(&String, &String)> = environment.iter().collect();
    injected.sort();
    for (key, value) in injected {
        variables.insert(key.clone(), value.clone());
    }

    // CGI headers from RFC 3875
    variables.insert("AUTH_TYPE".to_owned(), "".to_owned()); // Not currently supported

    // CONTENT_LENGTH reflects the length of the message body after any
    // transfer codings have been removed, which is what Hyper hands us.
    variables.insert("CONTENT_LENGTH".to_owned(), format!("{}", content_length));

    // CONTENT_TYPE must be set if the client sent one. We do not attempt to
    // sniff a media type when none is presented.
    variables.insert(
        "CONTENT_TYPE".to_owned(),
        req.headers
            .get(CONTENT_TYPE)
            .map(|c| c.to_str().unwrap_or(""))
            .unwrap_or("")
            .to_owned(),
    );

    variables.insert("GATEWAY_INTERFACE".to_owned(), CGI_VERSION.to_owned());

    variables.insert(
        "QUERY_STRING".to_owned(),
        req.uri.query().unwrap_or("").to_owned(),
    );

    variables.insert("REMOTE_ADDR".to_owned(), client_addr.ip().to_string());
    variables.insert("REMOTE_HOST".to_owned(), client_addr.ip().to_string()); // The server MAY substitute it with REMOTE_ADDR
    variables.insert("REMOTE_USER".to_owned(), "".to_owned());
    variables.insert("REQUEST_METHOD".to_owned(), req.method.to_string());

    // The echo page answers every path, so the "script" is mounted at the
    // root and the whole path is PATH_INFO (RFC 3875 sections 4.1.5, 4.1.13).
    let raw_path = req.uri.path().to_owned();
    let path_info = url_escape::decode(&raw_path).to_string();
    variables.insert("SCRIPT_NAME".to_owned(), "/".to_owned());
    variables.insert("X_RAW_PATH_INFO".to_owned(), raw_path);
    variables.insert("PATH_INFO".to_owned(), path_info.clone());
    // PATH_TRANSLATED is the url-decoded version of PATH_INFO
    variables.insert("PATH_TRANSLATED".to_owned(), path_info);

    variables.insert("SERVER_NAME".to_owned(), host.clone());
    variables.insert("SERVER_PORT".to_owned(), port.clone());
    variables.insert(
        "SERVER_PROTOCOL".to_owned(),
        format!("{:?}", req.version),
    );
    variables.insert(
        "SERVER_SOFTWARE".to_owned(),
        SERVER_SOFTWARE_VERSION.to_owned(),
    );

    // Not defined by RFC 3875, so an X_ is prepended as it requires.
    let protocol = if use_tls { "https" } else { "http" };
    variables.insert(
        "X_FULL_URL".to_owned(),
        format!(
            "{}://{}:{}{}",
            protocol,
            host,
            port,
            req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("")
        ),
    );

    // Normalize incoming HTTP headers. RFC 3875 says:
    // "The HTTP header field name is converted to upper case, has all
    // occurrences of "-" replaced with "_" and has "HTTP_" prepended to
    // give the meta-variable name."
    req.headers.iter().for_each(|header| {
        let key = format!(
            "HTTP_{}",
            header.0.as_str().to_uppercase().replace("-", "_")
        );
        // Per RFC 3875 section 4.1.18, skip some headers
        if key == "HTTP_AUTHORIZATION" || key == "HTTP_CONNECTION" {
            return;
        }
        let val = header.1.to_str().unwrap_or("CORRUPT VALUE").to_owned();
        variables.insert(key, val);
    });

    variables
}

/// Internal utility function for parsing a host header.
///
/// This attempts to use three sources to construct a definitive host/port pair,
/// ordering by precedent.
///
/// - The content of the host header is considered most authoritative.
/// - Next most authoritative is the configured default hostname.
/// - As a last resort, we use the host/port that Hyper gives us.
/// - If none of these provide sufficient data, which is definitely a
///   possibility, we go with `localhost` as host and `80` as port.
fn parse_host_header_uri(
    headers: &HeaderMap,
    uri: &hyper::Uri,
    default_host: &str,
) -> (String, String) {
    let host_header = headers.get(HOST).and_then(|v| match v.to_str() {
        Err(_) => None,
        Ok(s) => Some(s.to_owned()),
    });

    let mut host = uri
        .host()
        .map(|h| h.to_string())
        .unwrap_or_else(|| "localhost".to_owned());
    let mut port = uri.port_u16().unwrap_or(80).to_string();

    let mut parse_host = |hdr: String| {
        let mut parts = hdr.splitn(2, ':');
        match parts.next() {
            Some(h) if !h.is_empty() => host = h.to_owned(),
            _ => {}
        }
        match parts.next() {
            Some(p) if !p.is_empty() => {
                debug!(port = p, "Overriding port");
                port = p.to_owned()
            }
            _ => {}
        }
    };

    // Override with the configured hostname if set.
    if !default_host.is_empty() {
        parse_host(default_host.to_owned());
    }

    // Finally, the value of the HOST header is considered authoritative.
    // When it comes to port number, the HOST header isn't necessarily 100%
    // trustworthy. But it appears that this is still the best behavior for
    // the CGI spec.
    if let Some(hdr) = host_header {
        parse_host(hdr);
    }

    (host, port)
}

/// Parameters parsed from the query string, in wire order.
fn query_params(uri: &hyper::Uri) -> Vec<(String, String)> {
    url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

/// Parameters parsed from a form-encoded request body, in wire order.
///
/// Bodies with any other content type produce an empty listing rather than
/// an error, matching how form data is surfaced to CGI scripts.
fn form_params(headers: &HeaderMap, body: &[u8]) -> Vec<(String, String)> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.trim()
                .to_ascii_lowercase()
                .starts_with(FORM_CONTENT_TYPE)
        })
        .unwrap_or(false);

    if !is_form {
        return vec![];
    }

    url::form_urlencoded::parse(body).into_owned().collect()
}

/// Escape the five standard HTML special characters.
fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn render_page(
    variables: &IndexMap<String, String>,
    query: &[(String, String)],
    form: &[(String, String)],
) -> String {
    let mut page = String::new();
    page.push_str("<html><body>");
    page.push_str(&format!("<h1>{}</h1>", PAGE_TITLE));
    push_section(
        &mut page,
        "Server Variables",
        variables.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    );
    push_section(
        &mut page,
        "GET Data",
        query.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    );
    push_section(
        &mut page,
        "POST Data",
        form.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    );
    page.push_str("</body></html>");
    page
}

fn push_section<'a>(
    page: &mut String,
    heading: &str,
    entries: impl Iterator<Item = (&'a str, &'a str)>,
) {
    page.push_str(&format!("<h2>{}</h2>", heading));
    page.push_str("<pre>");
    for (key, value) in entries {
        // The whole line is escaped, keys included, as htmlspecialchars would.
        page.push_str(&escape_html(&format!("{}: {}\n", key, value)));
    }
    page.push_str("</pre>");
}

#[cfg(test)]
mod test {
    use super::*;

    use std::str::FromStr;

    use hyper::http::request::Request;

    fn plain_context() -> RequestGlobalContext {
        RequestGlobalContext {
            default_host: "localhost:3000".to_owned(),
            use_tls: false,
            global_env_vars: HashMap::new(),
        }
    }

    fn client() -> RequestContext {
        RequestContext {
            client_addr: "192.168.0.1:3000".parse().expect("Should parse IP"),
        }
    }

    async fn body_string(res: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(res.into_body())
            .await
            .expect("read response body");
        String::from_utf8(bytes.to_vec()).expect("response body was UTF-8")
    }

    #[test]
    fn should_escape_all_five_special_characters() {
        assert_eq!(
            "&lt;a href=&quot;x&quot;&gt;it&#039;s &amp; so on&lt;/a&gt;",
            escape_html(r#"<a href="x">it's & so on</a>"#)
        );

        // Everything else passes through untouched.
        assert_eq!("héllo: wörld", escape_html("héllo: wörld"));
    }

    #[test]
    fn should_build_server_variables() {
        let (req, _) = Request::builder()
            .uri("https://example.com:3000/test%3brun?foo=bar")
            .header("X-Test-Header", "hello")
            .header("Accept", "text/html")
            .header("User-agent", "test")
            .header("Host", "example.com:3000")
            .header("Authorization", "supersecret")
            .header("Connection", "sensitive")
            .method("POST")
            .body(())
            .unwrap()
            .into_parts();
        let content_length = 1234;
        let client_addr = "192.168.0.1:3000".parse().expect("Should parse IP");
        let default_host = "example.com:3000";
        let use_tls = true;
        let mut env = HashMap::new();
        env.insert("DEPLOYMENT".to_owned(), "staging".to_owned());

        let variables = server_variables(
            &req,
            content_length,
            client_addr,
            default_host,
            use_tls,
            &env,
        );

        let want = |key: &str, expect: &str| {
            let v = variables
                .get(&key.to_owned())
                .unwrap_or_else(|| panic!("expected to find key {}", key));

            assert_eq!(expect, v, "Key: {}", key)
        };

        want("HTTP_ACCEPT", "text/html");
        want("REQUEST_METHOD", "POST");
        want("SERVER_PROTOCOL", "HTTP/1.1");
        want("HTTP_USER_AGENT", "test");
        want("SCRIPT_NAME", "/");
        want("SERVER_SOFTWARE", SERVER_SOFTWARE_VERSION);
        want("SERVER_PORT", "3000");
        want("SERVER_NAME", "example.com");
        want("AUTH_TYPE", "");
        want("REMOTE_ADDR", "192.168.0.1");
        want("REMOTE_HOST", "192.168.0.1");
        want("X_RAW_PATH_INFO", "/test%3brun");
        want("PATH_INFO", "/test;run");
        want("PATH_TRANSLATED", "/test;run");
        want("QUERY_STRING", "foo=bar");
        want("CONTENT_LENGTH", "1234");
        want("HTTP_HOST", "example.com:3000");
        want("GATEWAY_INTERFACE", "CGI/1.1");
        want("REMOTE_USER", "");
        want("X_FULL_URL", "https://example.com:3000/test%3brun?foo=bar");

        // Operator-injected variables are listed too.
        want("DEPLOYMENT", "staging");

        // Finally, security-sensitive headers should be removed.
        assert!(variables.get("HTTP_AUTHORIZATION").is_none());
        assert!(variables.get("HTTP_CONNECTION").is_none());
    }

    #[test]
    fn injected_variables_cannot_clobber_derived_ones() {
        let (req, _) = Request::builder()
            .uri("http://localhost:3000/")
            .method("GET")
            .body(())
            .unwrap()
            .into_parts();
        let client_addr = "127.0.0.1:9999".parse().expect("Should parse IP");
        let mut env = HashMap::new();
        env.insert("REQUEST_METHOD".to_owned(), "SPOOFED".to_owned());

        let variables = server_variables(&req, 0, client_addr, "", false, &env);

        assert_eq!("GET", variables.get("REQUEST_METHOD").expect("method set"));
    }

    #[test]
    fn test_parse_host_header_uri() {
        let hmap = |val: &str| {
            let mut hm = hyper::HeaderMap::new();
            hm.insert(
                "HOST",
                hyper::header::HeaderValue::from_str(val).expect("Made a header value"),
            );
            hm
        };

        let default_host = "example.com:1234";

        {
            // All should come from HOST header
            let headers = hmap("reqecho.net:31337");
            let uri = hyper::Uri::from_str("http://localhost:443/foo/bar").expect("parsed URI");

            let (host, port) = parse_host_header_uri(&headers, &uri, default_host);
            assert_eq!("reqecho.net", host);
            assert_eq!("31337", port);
        }
        {
            // Name should come from HOST, port should come from the default
            let headers = hmap("reqecho.net");
            let uri = hyper::Uri::from_str("http://localhost:443/foo/bar").expect("parsed URI");

            let (host, port) = parse_host_header_uri(&headers, &uri, default_host);
            assert_eq!("reqecho.net", host);
            assert_eq!("1234", port)
        }
        {
            // Host and port should come from the default hostname
            let headers = hyper::HeaderMap::new();
            let uri = hyper::Uri::from_str("http://localhost:8080/foo/bar").expect("parsed URI");

            let (host, port) = parse_host_header_uri(&headers, &uri, default_host);

            assert_eq!("example.com", host);
            assert_eq!("1234", port)
        }
        {
            // Host and port should come from URI
            let empty_host = "";
            let headers = hyper::HeaderMap::new();
            let uri = hyper::Uri::from_str("http://localhost:8080/foo/bar").expect("parsed URI");

            let (host, port) = parse_host_header_uri(&headers, &uri, empty_host);

            assert_eq!("localhost", host);
            assert_eq!("8080", port)
        }
    }

    #[test]
    fn should_parse_query_params_in_wire_order() {
        let uri = hyper::Uri::from_str("http://localhost/?a=1&b=2").expect("parsed URI");
        assert_eq!(
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "2".to_owned())
            ],
            query_params(&uri)
        );

        let bare = hyper::Uri::from_str("http://localhost/").expect("parsed URI");
        assert!(query_params(&bare).is_empty());
    }

    #[test]
    fn should_parse_form_body_only_when_form_encoded() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
        );
        assert_eq!(
            vec![("name".to_owned(), "a b".to_owned())],
            form_params(&headers, b"name=a+b")
        );

        let mut json_headers = hyper::HeaderMap::new();
        json_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(form_params(&json_headers, b"{\"name\":\"a\"}").is_empty());

        // No content type at all: not a form.
        assert!(form_params(&hyper::HeaderMap::new(), b"name=a").is_empty());
    }

    #[tokio::test]
    async fn response_should_have_status_and_content_type() {
        let req = Request::builder()
            .uri("http://localhost:3000/")
            .body(Body::empty())
            .unwrap();

        let res = handle(req, &client(), &plain_context()).await;

        assert_eq!(hyper::StatusCode::OK, res.status());
        assert_eq!(
            "text/html; charset=UTF-8",
            res.headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .expect("content type set")
        );
        assert_eq!(
            SERVER_SOFTWARE_VERSION,
            res.headers()
                .get(SERVER)
                .and_then(|v| v.to_str().ok())
                .expect("server header set")
        );
    }

    #[tokio::test]
    async fn page_should_have_exactly_one_of_each_section() {
        let req = Request::builder()
            .uri("http://localhost:3000/anything?x=1")
            .body(Body::from("ignored"))
            .unwrap();

        let page = body_string(handle(req, &client(), &plain_context()).await).await;

        for heading in [
            "<h2>Server Variables</h2>",
            "<h2>GET Data</h2>",
            "<h2>POST Data</h2>",
        ] {
            assert_eq!(1, page.matches(heading).count(), "Heading: {}", heading);
        }
        assert!(page.starts_with("<html><body>"));
        assert!(page.ends_with("</body></html>"));
    }

    #[tokio::test]
    async fn get_data_should_list_query_parameters() {
        let req = Request::builder()
            .uri("http://localhost:3000/?a=1&b=2")
            .body(Body::empty())
            .unwrap();

        let page = body_string(handle(req, &client(), &plain_context()).await).await;

        assert!(page.contains("a: 1\n"));
        assert!(page.contains("b: 2\n"));
    }

    #[tokio::test]
    async fn empty_request_should_render_empty_listings() {
        let req = Request::builder()
            .uri("http://localhost:3000/")
            .body(Body::empty())
            .unwrap();

        let page = body_string(handle(req, &client(), &plain_context()).await).await;

        assert!(page.contains("<h2>GET Data</h2><pre></pre>"));
        assert!(page.contains("<h2>POST Data</h2><pre></pre>"));
    }

    #[tokio::test]
    async fn post_data_should_list_form_parameters() {
        let req = Request::builder()
            .uri("http://localhost:3000/submit")
            .method("POST")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Body::from("name=reqecho&mode=debug"))
            .unwrap();

        let page = body_string(handle(req, &client(), &plain_context()).await).await;

        assert!(page.contains("name: reqecho\n"));
        assert!(page.contains("mode: debug\n"));
    }

    #[tokio::test]
    async fn special_characters_should_be_escaped_in_the_page() {
        let req = Request::builder()
            .uri("http://localhost:3000/?msg=%3Cscript%3Ealert(%22hi%22)%3C%2Fscript%3E")
            .header("X-Quote", "it's & fine")
            .body(Body::empty())
            .unwrap();

        let page = body_string(handle(req, &client(), &plain_context()).await).await;

        assert!(page.contains("msg: &lt;script&gt;alert(&quot;hi&quot;)&lt;/script&gt;"));
        assert!(page.contains("HTTP_X_QUOTE: it&#039;s &amp; fine"));
        assert!(!page.contains("<script>"));
    }
}
