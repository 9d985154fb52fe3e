//! A CGI-style echo responder.
//!
//! Point a FastCGI-speaking web server (nginx `fastcgi_pass`, for
//! example) at the listen address and every request comes back describing
//! itself.
//!
//! ```sh
//! cargo run --example echo -- localhost:9000
//! ```

use std::fmt::Write;
use std::net::TcpListener;
use switchboard::{FcgiInterface, FcgiRequest, InterfaceConfig};

fn main() {
    env_logger::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost:9000".to_string());
    let listener = TcpListener::bind(&address).expect("bind listen address");

    let mut interface = FcgiInterface::new(listener, InterfaceConfig::new(64, 16))
        .expect("construct FastCGI interface");

    let pool = threadpool::Builder::new().build();
    loop {
        let batch = match interface.accept_requests() {
            Ok(batch) => batch,
            Err(e) => {
                log::error!(error:err = e; "accept_requests failed");
                break;
            }
        };
        for request in batch {
            pool.execute(move || respond(request));
        }
    }
    pool.join();
}

fn respond(mut request: FcgiRequest) {
    let mut body = String::new();
    let method = request.env_str("REQUEST_METHOD").unwrap_or("-").to_string();
    let path = request.env_str("PATH_INFO").unwrap_or("-").to_string();
    let _ = writeln!(body, "{method} {path}");
    for (name, value) in request.environment() {
        let _ = writeln!(
            body,
            "{}={}",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(value)
        );
    }
    let _ = writeln!(body, "body: {} bytes", request.stdin().len());

    if request.abort_status() {
        request.complete(1);
        return;
    }

    let response = format!("Content-Type: text/plain\n\n{body}");
    if request.write_stdout(response.as_bytes()) {
        request.complete(0);
    }
}
