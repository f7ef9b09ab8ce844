//! Caddy admin API implementation of [`ConfigLoader`].
//!
//! Config text is posted as `text/caddyfile` to `<admin_url>/adapt` for
//! validation and `<admin_url>/load` to apply it. Transport failures are
//! retried with linear back-off; an HTTP answer, including a rejection, is
//! never retried.

use crate::activation::{ConfigLoader, LoaderError};
use crate::config::CaddySettings;
use std::time::Duration;

const ADAPT_ENDPOINT: &str = "/adapt";
const LOAD_ENDPOINT: &str = "/load";
const CADDYFILE_CONTENT_TYPE: &str = "text/caddyfile";
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Config loader backed by the Caddy admin API.
pub struct CaddyAdminLoader {
    admin_url: String,
    token: Option<String>,
    max_attempts: u32,
    backoff: Duration,
    agent: ureq::Agent,
}

impl CaddyAdminLoader {
    /// Create a loader from operator settings.
    #[must_use]
    pub fn new(settings: &CaddySettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout()))
            .http_status_as_error(false)
            .proxy(None)
            .build();
        Self {
            admin_url: settings.admin_url().to_owned(),
            token: settings.token().map(str::to_owned),
            max_attempts: settings.max_attempts(),
            backoff: RETRY_BACKOFF,
            agent: ureq::Agent::new_with_config(config),
        }
    }

    /// Override the back-off unit between attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.admin_url)
    }

    fn post(&self, endpoint: &str, config: &str) -> Result<(), LoaderError> {
        let url = self.endpoint_url(endpoint);
        let mut last_error = LoaderError::Transport {
            endpoint: endpoint.to_owned(),
            reason: "no attempts made".to_owned(),
        };

        for attempt in 1..=self.max_attempts {
            let mut request = self
                .agent
                .post(url.as_str())
                .header("Content-Type", CADDYFILE_CONTENT_TYPE);
            if let Some(token) = &self.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            match request.send(config) {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        log::debug!("{url} accepted config");
                        return Ok(());
                    }
                    let body = response
                        .into_body()
                        .read_to_string()
                        .unwrap_or_default()
                        .trim()
                        .to_owned();
                    return Err(LoaderError::Rejected {
                        endpoint: endpoint.to_owned(),
                        status,
                        body,
                    });
                }
                Err(ureq::Error::Timeout(_)) => {
                    last_error = LoaderError::Timeout {
                        endpoint: endpoint.to_owned(),
                    };
                }
                Err(err) => {
                    last_error = LoaderError::Transport {
                        endpoint: endpoint.to_owned(),
                        reason: err.to_string(),
                    };
                }
            }

            if attempt < self.max_attempts {
                log::debug!("attempt {attempt} to {url} failed: {last_error}; retrying");
                std::thread::sleep(self.backoff * attempt);
            }
        }
        Err(last_error)
    }
}

impl ConfigLoader for CaddyAdminLoader {
    fn adapt(&self, config: &str) -> Result<(), LoaderError> {
        self.post(ADAPT_ENDPOINT, config)
    }

    fn load(&self, config: &str) -> Result<(), LoaderError> {
        self.post(LOAD_ENDPOINT, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    /// Request as seen by the stub admin API.
    #[derive(Debug)]
    struct Captured {
        request_line: String,
        headers: Vec<String>,
        body: String,
    }

    /// Serve one canned response per connection, `responses.len()` times.
    fn stub_admin(responses: Vec<(u16, &'static str)>) -> (String, mpsc::Receiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let (stream, _) = listener.accept().expect("accept");
                let captured = serve(stream, status, body);
                if sender.send(captured).is_err() {
                    break;
                }
            }
        });
        (url, receiver)
    }

    fn serve(stream: TcpStream, status: u16, body: &str) -> Captured {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut request_line = String::new();
        reader.read_line(&mut request_line).expect("request line");
        let mut headers = Vec::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("header line");
            let line = line.trim_end().to_owned();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().expect("content length");
                }
            }
            headers.push(line);
        }
        let mut request_body = vec![0_u8; content_length];
        reader.read_exact(&mut request_body).expect("request body");

        let mut stream = stream;
        write!(
            stream,
            "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .expect("write response");
        Captured {
            request_line: request_line.trim_end().to_owned(),
            headers,
            body: String::from_utf8(request_body).expect("UTF-8 body"),
        }
    }

    fn settings(admin_url: &str, token: Option<&str>) -> CaddySettings {
        CaddySettings {
            admin_url: Some(admin_url.to_owned()),
            token: token.map(str::to_owned),
            timeout_secs: 5,
            max_attempts: 2,
        }
    }

    #[test]
    fn adapt_posts_caddyfile_with_token() {
        let (url, requests) = stub_admin(vec![(200, "{}")]);
        let loader = CaddyAdminLoader::new(&settings(&url, Some("s3cret")));

        loader.adapt(":80 {\n\trespond ok\n}").expect("adapt");

        let captured = requests.recv().expect("captured request");
        assert_eq!(captured.request_line, "POST /adapt HTTP/1.1");
        assert_eq!(captured.body, ":80 {\n\trespond ok\n}");
        let has_header = |expected: &str| {
            captured
                .headers
                .iter()
                .any(|header| header.eq_ignore_ascii_case(expected))
        };
        assert!(has_header("content-type: text/caddyfile"), "{captured:?}");
        assert!(has_header("authorization: Bearer s3cret"), "{captured:?}");
    }

    #[test]
    fn rejection_surfaces_status_and_body() {
        let (url, _requests) = stub_admin(vec![(400, "  unrecognized directive: wafx \n")]);
        let loader = CaddyAdminLoader::new(&settings(&format!("{url}/"), None));

        let err = loader.load("wafx").expect_err("rejected");

        assert_eq!(
            err,
            LoaderError::Rejected {
                endpoint: LOAD_ENDPOINT.to_owned(),
                status: 400,
                body: "unrecognized directive: wafx".to_owned(),
            }
        );
    }

    #[test]
    fn transport_failures_are_retried_then_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        drop(listener);
        let loader =
            CaddyAdminLoader::new(&settings(&url, None)).with_backoff(Duration::from_millis(1));

        let err = loader.load("config").expect_err("connection refused");

        assert!(matches!(err, LoaderError::Transport { .. }), "{err:?}");
    }

    #[test]
    fn endpoint_url_joins_without_double_slash() {
        let loader = CaddyAdminLoader::new(&settings("http://caddy:2019///", None));
        assert_eq!(loader.endpoint_url(ADAPT_ENDPOINT), "http://caddy:2019/adapt");
    }
}
