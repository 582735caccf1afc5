//! 集成测试用的 HTTP/1.1 文件服务器
//!
//! 只提供一个静态文件：HEAD 返回大小，带 Range 的 GET 返回 206。
//! 支持注入一次性失败、限速发送、错误的 Content-Length、302 跳转和请求记录

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// false 时 HEAD 返回 405
    pub head_allowed: bool,
    /// false 时忽略 Range，始终返回 200 和完整内容
    pub support_ranges: bool,
    /// 限速：每发送这么多字节暂停一次
    pub throttle: Option<(usize, Duration)>,
    /// Content-Disposition 中的文件名
    pub file_name: Option<String>,
    /// true 时 206 响应的 Content-Length 比 Content-Range 多 1
    pub bad_content_length: bool,
    /// true 时对外地址是 `/redirect/payload.bin`，302 到真实文件
    pub redirect: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            throttle: None,
            file_name: None,
            bad_content_length: false,
            redirect: false,
        }
    }
}

/// 一次请求的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    /// `bytes=a-b` 的 (a, b)，b 为闭区间上界
    pub range: Option<(u64, u64)>,
}

impl RequestRecord {
    /// 本次请求要求的字节数
    pub fn requested_bytes(&self, total: u64) -> u64 {
        match self.range {
            Some((start, end)) => end.min(total.saturating_sub(1)) + 1 - start.min(total),
            None => total,
        }
    }
}

const FILE_PATH: &str = "/files/payload.bin";

struct Shared {
    body: Vec<u8>,
    opts: ServerOptions,
    log: Mutex<Vec<RequestRecord>>,
    /// Range 起点 -> (状态码, 剩余次数)
    failures: Mutex<HashMap<u64, (u16, u32)>>,
}

/// 后台线程中运行的服务器，进程退出时结束
#[derive(Clone)]
pub struct RangeServer {
    pub url: String,
    shared: Arc<Shared>,
}

impl RangeServer {
    pub fn start(body: Vec<u8>) -> Self {
        Self::start_with_options(body, ServerOptions::default())
    }

    pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let entry = if opts.redirect { "redirect" } else { "files" };
        let shared = Arc::new(Shared {
            body,
            opts,
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        });

        let accept = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let shared = accept.clone();
                thread::spawn(move || handle(stream, &shared));
            }
        });

        Self {
            url: format!("http://127.0.0.1:{}/{}/payload.bin", port, entry),
            shared,
        }
    }

    /// 下一次从 `start` 开始的 Range 请求返回 `status`
    pub fn fail_once_at(&self, start: u64, status: u16) {
        self.shared
            .failures
            .lock()
            .unwrap()
            .insert(start, (status, 1));
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.shared.log.lock().unwrap().clone()
    }

    /// 实际返回文件内容的 GET 请求（不含 `bytes=0-0` 和跳转）
    pub fn gets(&self) -> Vec<RequestRecord> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET" && r.path == FILE_PATH && r.range != Some((0, 0)))
            .collect()
    }

    pub fn body_len(&self) -> u64 {
        self.shared.body.len() as u64
    }
}

fn handle(mut stream: TcpStream, shared: &Shared) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, path, range) = parse_request(request);
    shared.log.lock().unwrap().push(RequestRecord {
        method: method.to_string(),
        path: path.to_string(),
        range,
    });

    if path.starts_with("/redirect/") {
        let _ = stream.write_all(
            format!(
                "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                FILE_PATH
            )
            .as_bytes(),
        );
        return;
    }

    let body = &shared.body;
    let opts = &shared.opts;
    let total = body.len() as u64;
    let mut extra = String::new();
    if opts.support_ranges {
        extra.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(name) = &opts.file_name {
        extra.push_str(&format!(
            "Content-Disposition: attachment; filename=\"{}\"\r\n",
            name
        ));
    }

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
            total, extra
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(
            b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    if let Some((start, _)) = range {
        let injected = {
            let mut failures = shared.failures.lock().unwrap();
            match failures.get_mut(&start) {
                Some((status, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            }
        };
        if let Some(status) = injected {
            let response = format!(
                "HTTP/1.1 {} Injected\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            let _ = stream.write_all(response.as_bytes());
            return;
        }
    }

    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if opts.support_ranges => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl || start >= total {
                (
                    "416 Range Not Satisfiable",
                    format!("Content-Range: bytes */{}\r\n", total),
                    &body[0..0],
                )
            } else {
                (
                    "206 Partial Content",
                    format!("Content-Range: bytes {}-{}/{}\r\n", start, end_incl, total),
                    &body[start as usize..=end_incl as usize],
                )
            }
        }
        _ => ("200 OK", String::new(), &body[..]),
    };

    let advertised = if opts.bad_content_length && status.starts_with("206") {
        slice.len() + 1
    } else {
        slice.len()
    };
    let header = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status, advertised, content_range, extra
    );
    if stream.write_all(header.as_bytes()).is_err() {
        return;
    }

    match opts.throttle {
        Some((step, pause)) => {
            for piece in slice.chunks(step.max(1)) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(pause);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// 返回 (method, path, Range: bytes=X-Y 的 (X, Y))
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut lines = request.lines();
    let mut request_line = lines.next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("");
    let path = request_line.next().unwrap_or("");

    let range = lines
        .map(str::trim)
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| {
            let spec = value.trim().strip_prefix("bytes=")?;
            let (a, b) = spec.split_once('-')?;
            let start = a.trim().parse::<u64>().ok()?;
            let end = match b.trim() {
                "" => u64::MAX,
                e => e.parse::<u64>().ok()?,
            };
            Some((start, end))
        });

    (method, path, range)
}
