//! Per-stream lifecycle (§3 "Stream", §4.3). `transition_state` keeps the
//! teacher's table-driven shape, generalized to read off the tagged `Frame`
//! enum instead of the old `Flags`/`FramePayload` pair.
use crate::error::H2Error;
use crate::flow;
use crate::frame::Frame;
use crate::hpack;
use crate::response::Response;
use crate::types::{HeaderList, NonZeroStreamId, MAX_WINDOW_SIZE};
use bytes::BytesMut;
use derivative::Derivative;
use log::trace;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Continuing {
    Headers,
    PushPromise,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    pub id: NonZeroStreamId,
    #[derivative(Debug = "ignore")]
    pub response_tx: Option<oneshot::Sender<Result<Response, H2Error>>>,
    pub send_window: i64,
    pub recv_window: i64,
    state: StreamState,
    continuing: Option<Continuing>,
    dependency: Option<(u32, bool, u8)>,
    headers_buffer: BytesMut,
    body_buffer: BytesMut,
    response_headers: HeaderList,
    request_id: usize,
}

impl Stream {
    #[must_use]
    pub fn new(id: NonZeroStreamId, request_id: usize, initial_window: u32) -> Self {
        Self {
            id,
            response_tx: None,
            send_window: i64::from(initial_window),
            recv_window: i64::from(initial_window),
            state: StreamState::Idle,
            continuing: None,
            dependency: None,
            headers_buffer: BytesMut::with_capacity(4096),
            body_buffer: BytesMut::new(),
            response_headers: HeaderList::new(),
            request_id,
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn set_response_tx(&mut self, tx: oneshot::Sender<Result<Response, H2Error>>) {
        self.response_tx = Some(tx);
    }

    /// Marks a client-initiated stream as having sent its request (the only
    /// way a client moves itself out of Idle).
    pub fn note_local_headers_sent(&mut self, end_stream: bool) {
        self.state = if end_stream {
            StreamState::HalfClosedLocal
        } else {
            StreamState::Open
        };
    }

    pub fn apply_settings_window_delta(&mut self, delta: i64) -> Result<(), H2Error> {
        self.send_window = flow::apply_initial_window_delta(self.send_window, delta)?;
        Ok(())
    }

    /// https://httpwg.org/specs/rfc7540.html#StreamStates
    ///
    /// `frame` is the inbound frame driving the transition; `recv` is
    /// always true here since outbound transitions are driven explicitly by
    /// `note_local_headers_sent`/the connection engine's DATA writer.
    fn transition_on_recv(&mut self, frame: &Frame) -> Result<(), H2Error> {
        let original_state = self.state;

        if let Frame::ResetStream { .. } = frame {
            if self.state == StreamState::Idle {
                return Err(H2Error::StreamState {
                    stream: self.id.get(),
                    reason: "RST_STREAM received on an idle stream",
                });
            }
            self.state = StreamState::Closed;
            trace!("stream {} {:?} -> {:?}", self.id, original_state, self.state);
            return Ok(());
        }

        if self.state == StreamState::Closed {
            return match frame {
                Frame::Priority { .. } | Frame::WindowUpdate { .. } => Ok(()),
                _ => Err(H2Error::StreamState {
                    stream: self.id.get(),
                    reason: "frame received on a closed stream",
                }),
            };
        }

        let header_ends = matches!(frame, Frame::Headers { end_headers: true, .. })
            || matches!(
                (frame, self.continuing),
                (Frame::Continuation { end_headers: true, .. }, Some(Continuing::Headers))
            );
        let push_promise_ends = matches!(frame, Frame::PushPromise { end_headers: true, .. })
            || matches!(
                (frame, self.continuing),
                (Frame::Continuation { end_headers: true, .. }, Some(Continuing::PushPromise))
            );
        let end_stream = matches!(frame, Frame::Data { end_stream: true, .. })
            || matches!(frame, Frame::Headers { end_stream: true, end_headers: true, .. });

        if self.state == StreamState::Idle {
            if push_promise_ends {
                self.state = StreamState::ReservedRemote;
            } else if header_ends {
                self.state = StreamState::Open;
            } else if matches!(frame, Frame::Data { .. }) {
                return Err(H2Error::Protocol("DATA received before any HEADERS"));
            }
        }

        if self.state == StreamState::ReservedLocal && header_ends {
            self.state = StreamState::HalfClosedRemote;
        }

        if self.state == StreamState::Open && end_stream {
            self.state = StreamState::HalfClosedRemote;
        }

        if self.state == StreamState::HalfClosedLocal && end_stream {
            self.state = StreamState::Closed;
        } else if self.state == StreamState::HalfClosedLocal
            && matches!(frame, Frame::Data { .. } | Frame::Headers { .. })
        {
            // legal: the peer may keep sending until it signals END_STREAM
        }

        if self.state != original_state {
            trace!("stream {} {:?} -> {:?}", self.id, original_state, self.state);
        }
        Ok(())
    }

    /// Applies one inbound stream-scoped frame. Returns `Some(response)`
    /// when END_STREAM completes the response and no caller is awaiting
    /// (the caller dropped the awaiter) -- normally the response is
    /// delivered via `response_tx` and this returns `None`.
    pub fn handle_frame(
        &mut self,
        frame: Frame,
        decoder: &mut hpack::Decoder,
        max_header_list_size: usize,
        max_header_count: usize,
    ) -> Result<(), H2Error> {
        if self.continuing.is_some() && !matches!(frame, Frame::Continuation { .. }) {
            return Err(H2Error::Protocol(
                "frame other than CONTINUATION received while a header block is incomplete",
            ));
        }
        self.transition_on_recv(&frame)?;
        match frame {
            Frame::Data { data, end_stream, .. } => {
                flow::debit(&mut self.recv_window, data.len() as u32, false)?;
                self.body_buffer.extend_from_slice(&data);
                if end_stream {
                    self.deliver_response();
                }
            }
            Frame::Headers {
                end_stream,
                end_headers,
                dependency,
                block,
                ..
            } => {
                if let Some(dep) = dependency {
                    self.dependency = Some(dep);
                }
                self.headers_buffer.extend_from_slice(&block);
                if end_headers {
                    self.decode_headers(decoder, max_header_list_size, max_header_count)?;
                    if end_stream {
                        self.deliver_response();
                    }
                } else {
                    self.continuing = Some(Continuing::Headers);
                }
            }
            Frame::PushPromise { block, end_headers, .. } => {
                self.headers_buffer.extend_from_slice(&block);
                self.continuing = if end_headers {
                    None
                } else {
                    Some(Continuing::PushPromise)
                };
            }
            Frame::Continuation { block, end_headers, .. } => {
                self.headers_buffer.extend_from_slice(&block);
                if end_headers {
                    let was_push_promise = matches!(self.continuing, Some(Continuing::PushPromise));
                    self.continuing = None;
                    if !was_push_promise {
                        self.decode_headers(decoder, max_header_list_size, max_header_count)?;
                        if self.state == StreamState::HalfClosedRemote || self.state == StreamState::Closed {
                            self.deliver_response();
                        }
                    }
                }
            }
            Frame::Priority {
                dependency,
                exclusive,
                weight,
                ..
            } => {
                self.dependency = Some((dependency, exclusive, weight));
            }
            Frame::WindowUpdate { increment, .. } => {
                flow::credit(&mut self.send_window, increment, false)?;
            }
            Frame::ResetStream { error, .. } => {
                return Err(H2Error::RemoteRefusal {
                    stream: self.id.get(),
                    code: error,
                });
            }
            Frame::GoAway { .. } | Frame::Settings { .. } | Frame::Ping { .. } | Frame::Unknown { .. } => {
                unreachable!("connection-scoped frames are never routed to a stream")
            }
        }
        Ok(())
    }

    pub fn has_pending_continuation(&self) -> bool {
        self.continuing.is_some()
    }

    fn decode_headers(
        &mut self,
        decoder: &mut hpack::Decoder,
        max_header_list_size: usize,
        max_header_count: usize,
    ) -> Result<(), H2Error> {
        let headers = decoder.decode(&self.headers_buffer, max_header_list_size, max_header_count)?;
        self.response_headers.extend(headers);
        self.headers_buffer.clear();
        Ok(())
    }

    fn deliver_response(&mut self) {
        if let Some(tx) = self.response_tx.take() {
            let response = Response {
                request_id: self.request_id,
                headers: self.response_headers.clone(),
                body: self.body_buffer.clone().freeze(),
            };
            trace!("delivering response for stream {}: {:#?}", self.id, response);
            // the caller may have dropped its awaiter (e.g. after a timeout);
            // that's not this stream's problem to report.
            tx.send(Ok(response)).ok();
        }
    }

    /// Fails the awaiter with a typed error: RST_STREAM, GOAWAY covering this
    /// id, connection close, or a caller-side timeout (§4.5 "request
    /// lifecycle").
    pub fn fail(&mut self, err: H2Error) {
        self.state = StreamState::Closed;
        if let Some(tx) = self.response_tx.take() {
            tx.send(Err(err)).ok();
        }
    }
}

#[must_use]
pub fn send_window_ceiling() -> i64 {
    MAX_WINDOW_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_INITIAL_WINDOW_SIZE;
    use bytes::Bytes;

    fn stream() -> Stream {
        Stream::new(NonZeroStreamId::new(1).unwrap(), 1, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    #[test]
    fn idle_to_open_on_headers_without_end_stream() {
        let mut s = stream();
        let mut decoder = hpack::Decoder::default();
        let mut enc = hpack::Encoder::default();
        let block = enc
            .encode(&vec![(":status".to_string(), "200".to_string())])
            .unwrap();
        s.handle_frame(
            Frame::Headers {
                stream_id: s.id,
                end_stream: false,
                end_headers: true,
                dependency: None,
                block,
            },
            &mut decoder,
            1 << 20,
            100,
        )
        .unwrap();
        assert_eq!(s.state(), StreamState::Open);
    }

    #[test]
    fn headers_with_end_stream_half_closes_remote() {
        let mut s = stream();
        let mut decoder = hpack::Decoder::default();
        let mut enc = hpack::Encoder::default();
        let block = enc
            .encode(&vec![(":status".to_string(), "204".to_string())])
            .unwrap();
        s.handle_frame(
            Frame::Headers {
                stream_id: s.id,
                end_stream: true,
                end_headers: true,
                dependency: None,
                block,
            },
            &mut decoder,
            1 << 20,
            100,
        )
        .unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn reset_on_idle_is_rejected() {
        let mut s = stream();
        let mut decoder = hpack::Decoder::default();
        let err = s
            .handle_frame(
                Frame::ResetStream {
                    stream_id: s.id,
                    error: crate::types::ErrorType::Cancel,
                },
                &mut decoder,
                1 << 20,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, H2Error::StreamState { .. }));
    }

    #[test]
    fn data_before_headers_is_protocol_error() {
        let mut s = stream();
        let mut decoder = hpack::Decoder::default();
        let err = s
            .handle_frame(
                Frame::Data {
                    stream_id: s.id,
                    end_stream: false,
                    data: Bytes::from_static(b"x"),
                },
                &mut decoder,
                1 << 20,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, H2Error::Protocol(_)));
    }

    #[test]
    fn window_update_credits_send_window() {
        let mut s = stream();
        let mut decoder = hpack::Decoder::default();
        let before = s.send_window;
        s.handle_frame(
            Frame::WindowUpdate {
                stream_id: s.id.get(),
                increment: 100,
            },
            &mut decoder,
            1 << 20,
            100,
        )
        .unwrap();
        assert_eq!(s.send_window, before + 100);
    }

    #[test]
    fn continuation_without_end_headers_keeps_pending() {
        let mut s = stream();
        let mut decoder = hpack::Decoder::default();
        s.handle_frame(
            Frame::Headers {
                stream_id: s.id,
                end_stream: false,
                end_headers: false,
                dependency: None,
                block: Bytes::new(),
            },
            &mut decoder,
            1 << 20,
            100,
        )
        .unwrap();
        assert!(s.has_pending_continuation());
    }
}
