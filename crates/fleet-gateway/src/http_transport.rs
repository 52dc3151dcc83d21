//! HTTP/1.1 transport over hyper.
//!
//! Every call opens its own connection, the same way the health probes do;
//! control traffic is low volume and instances come and go.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use http::Response;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::sse::{SseDecoder, SseItem};
use crate::transport::{
    EventStream, GatewayRequest, GatewayTransport, Target, CONNECTION_CREATED_HEADER,
    SERVER_ID_HEADER,
};

/// Connect timeout for the event subscription.
const EVENTS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport reaching `http://{identity}:{control_port}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    control_port: u16,
}

impl HttpTransport {
    pub fn new(control_port: u16) -> Self {
        Self { control_port }
    }

    fn authority(&self, target: &Target) -> String {
        format!("{}:{}", target.host, self.control_port)
    }

    /// Connect, send one request and hand back the response head. The
    /// returned guard keeps the connection driver alive.
    async fn send(
        &self,
        target: &Target,
        request: &GatewayRequest,
        accept: &str,
    ) -> GatewayResult<(Response<Incoming>, ConnGuard)> {
        let authority = self.authority(target);
        let uri = format!("http://{authority}{}", request.path);

        let stream = TcpStream::connect(&authority)
            .await
            .map_err(|e| GatewayError::Connect(format!("{authority}: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| GatewayError::Connect(format!("{authority}: {e}")))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "gateway connection closed with error");
            }
        });
        let guard = ConnGuard(driver.abort_handle());

        let req = http::Request::builder()
            .method(request.method.clone())
            .uri(&uri)
            .header(HOST, &authority)
            .header(USER_AGENT, "fleet-gateway/0.1")
            .header(ACCEPT, accept)
            .header(CONTENT_TYPE, "application/json")
            .header(SERVER_ID_HEADER, target.server_id.to_string())
            .header(CONNECTION_CREATED_HEADER, target.created_at.to_rfc3339())
            .body(Full::new(request.body.clone()))
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| GatewayError::Connect(format!("{uri}: {e}")))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Status {
                status: resp.status().as_u16(),
                path: request.path.clone(),
            });
        }
        Ok((resp, guard))
    }

    async fn open_events(&self, target: &Target) -> GatewayResult<EventStream> {
        let request = GatewayRequest::get("/events", EVENTS_CONNECT_TIMEOUT);
        let (resp, guard) = tokio::time::timeout(
            EVENTS_CONNECT_TIMEOUT,
            self.send(target, &request, "text/event-stream"),
        )
        .await
        .map_err(|_| GatewayError::BadRequest("timed out opening /events".to_string()))??;

        let state = EventBody {
            body: resp.into_body(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            _guard: guard,
        };

        Ok(futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((Ok(item), state));
                }
                match state.body.frame().await {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            let items = state.decoder.push(&data);
                            state.pending.extend(items);
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(GatewayError::Connect(e.to_string())), state));
                    }
                    None => return None,
                }
            }
        })
        .boxed())
    }
}

/// Aborts the connection driver when the owner goes away.
struct ConnGuard(AbortHandle);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct EventBody {
    body: Incoming,
    decoder: SseDecoder,
    pending: VecDeque<SseItem>,
    _guard: ConnGuard,
}

#[async_trait]
impl GatewayTransport for HttpTransport {
    async fn call(&self, target: &Target, request: GatewayRequest) -> GatewayResult<Bytes> {
        let timeout = request.timeout;
        tokio::time::timeout(timeout, async {
            let (resp, _guard) = self.send(target, &request, "application/json").await?;
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| GatewayError::Connect(e.to_string()))?;
            Ok::<_, GatewayError>(body.to_bytes())
        })
        .await
        .map_err(|_| {
            GatewayError::BadRequest(format!("{} timed out after {timeout:?}", request.path))
        })?
    }

    fn events(&self, target: &Target) -> EventStream {
        let this = self.clone();
        let target = target.clone();
        futures::stream::once(async move { this.open_events(&target).await })
            .flat_map(|opened| match opened {
                Ok(stream) => stream,
                Err(e) => futures::stream::iter([Err(e)]).boxed(),
            })
            .boxed()
    }
}
