//! Output scheduler
//!
//! One thread per connection drains response producers onto the writer.
//! Producers enqueue themselves when they have headers, body bytes or an
//! end-of-stream to emit. Each turn moves at most one frame's worth of body
//! for a stream, then the stream goes to the back of the queue, so streams
//! with data share the connection round-robin.
//!
//! A producer that runs out of connection credit is parked on the writer
//! and requeued by the next connection WINDOW_UPDATE. One that runs out of
//! stream credit waits for its own WINDOW_UPDATE.

use super::error::Result;
use super::pipe::{OutputProducer, ProducerState};
use super::writer::{FrameWriter, WriterState};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Scheduler queue entry
pub enum WorkItem {
    /// A producer with output to move
    Produce(Arc<OutputProducer>),
    /// Stop the scheduler thread
    Stop,
}

/// Handle to a running scheduler thread
pub struct OutputScheduler {
    sender: Sender<WorkItem>,
    handle: Option<JoinHandle<()>>,
}

impl OutputScheduler {
    /// Spawn the scheduler thread for one connection
    pub fn spawn(writer: Arc<FrameWriter>, connection_id: u64) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("h2-output-{}", connection_id))
            .spawn(move || run(writer, receiver, connection_id))?;

        Ok(OutputScheduler {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue handle given to producers
    pub fn sender(&self) -> Sender<WorkItem> {
        self.sender.clone()
    }

    /// Stop the thread after it drains what is already queued
    pub fn stop(&mut self) {
        let _ = self.sender.send(WorkItem::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(writer: Arc<FrameWriter>, receiver: Receiver<WorkItem>, connection_id: u64) {
    trace!(connection_id, "output scheduler started");
    while let Ok(item) = receiver.recv() {
        match item {
            WorkItem::Produce(producer) => {
                if let Err(e) = produce(&writer, &producer) {
                    debug!(connection_id, error = %e, "output write failed");
                    producer.abort();
                }
            }
            WorkItem::Stop => break,
        }
    }
    trace!(connection_id, "output scheduler stopped");
}

/// Outcome of one scheduling turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Turn {
    /// Nothing left to do until the application writes again
    Idle,
    /// END_STREAM went out
    Completed,
    /// More body is ready and credit remains
    Requeue,
    /// Waiting for a connection WINDOW_UPDATE
    ConnectionParked,
    /// Waiting for a stream WINDOW_UPDATE
    StreamParked,
}

/// Run one turn for a producer
pub(crate) fn produce(writer: &FrameWriter, producer: &Arc<OutputProducer>) -> Result<Turn> {
    let mut conn = writer.lock();
    let mut output = producer.lock();
    output.scheduled = false;

    if output.completed || output.aborted {
        producer.notify();
        return Ok(Turn::Idle);
    }
    if conn.is_completed() {
        drop(output);
        drop(conn);
        producer.abort();
        return Ok(Turn::Idle);
    }

    let turn = write_turn(&mut conn, &mut output)?;
    match turn {
        Turn::Completed => producer.mark_completed(&mut output),
        Turn::ConnectionParked => {
            output.scheduled = true;
            conn.park(Arc::clone(producer));
        }
        Turn::StreamParked => output.waiting_stream_window = true,
        Turn::Requeue => producer.schedule(&mut output),
        Turn::Idle => {}
    }
    producer.notify();
    Ok(turn)
}

fn write_turn(conn: &mut WriterState, output: &mut ProducerState) -> Result<Turn> {
    let stream_id = output.stream_id;

    if let Some((status, headers)) = output.headers.take() {
        let end_stream =
            output.end_requested && output.pending.is_empty() && output.trailers.is_none();
        conn.write_headers(stream_id, Some(status), &headers, end_stream)?;
        output.headers_sent = true;
        if end_stream {
            return Ok(Turn::Completed);
        }
    }

    if !output.pending.is_empty() {
        if !conn.window.is_available() {
            return Ok(Turn::ConnectionParked);
        }
        if !output.window.is_available() {
            return Ok(Turn::StreamParked);
        }

        let budget = output
            .pending
            .len()
            .min(output.window.available() as usize)
            .min(conn.window.available() as usize)
            .min(conn.max_frame_size());
        let granted = conn.window.consume(budget);
        output.window.consume(granted);

        let chunk = output.pending.split_to(granted).freeze();
        let end_stream =
            output.end_requested && output.pending.is_empty() && output.trailers.is_none();
        trace!(stream_id, len = chunk.len(), end_stream, "writing DATA");
        conn.write_data(stream_id, chunk, end_stream)?;
        if end_stream {
            return Ok(Turn::Completed);
        }

        if !output.pending.is_empty() {
            if !conn.window.is_available() {
                return Ok(Turn::ConnectionParked);
            }
            if !output.window.is_available() {
                return Ok(Turn::StreamParked);
            }
            return Ok(Turn::Requeue);
        }
    }

    if output.end_requested && output.headers_sent {
        // Trailers ride in the same lock hold as the last DATA frame.
        match output.trailers.take() {
            Some(trailers) => conn.write_headers(stream_id, None, &trailers, true)?,
            None => conn.write_data(stream_id, bytes::Bytes::new(), true)?,
        }
        return Ok(Turn::Completed);
    }

    Ok(Turn::Idle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::frames::FrameType;
    use crate::http::h2::writer::tests::capture_writer;
    use crate::http::Headers;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn producer(window: u32) -> (Arc<OutputProducer>, Receiver<WorkItem>, Arc<AtomicUsize>) {
        let (tx, rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(1));
        (
            Arc::new(OutputProducer::new(1, window, tx, Arc::clone(&active))),
            rx,
            active,
        )
    }

    #[test]
    fn test_headers_only_response_is_single_frame() {
        let (writer, capture) = capture_writer();
        let (producer, _rx, active) = producer(65_535);
        {
            let mut state = producer.lock();
            state.headers = Some((200, Headers::new()));
            state.end_requested = true;
        }

        assert_eq!(produce(&writer, &producer).unwrap(), Turn::Completed);
        let frames = capture.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type(), Some(FrameType::Headers));
        assert!(frames[0].flags.is_end_stream());
        assert!(producer.is_completed());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_body_then_trailers() {
        let (writer, capture) = capture_writer();
        let (producer, _rx, _active) = producer(65_535);
        {
            let mut state = producer.lock();
            state.headers = Some((200, Headers::new()));
            state.pending.extend_from_slice(b"body");
            let mut trailers = Headers::new();
            trailers.insert("grpc-status", "0");
            state.trailers = Some(trailers);
            state.end_requested = true;
        }

        assert_eq!(produce(&writer, &producer).unwrap(), Turn::Completed);
        let kinds: Vec<_> = capture.frames().iter().map(|f| f.frame_type()).collect();
        assert_eq!(
            kinds,
            vec![
                Some(FrameType::Headers),
                Some(FrameType::Data),
                Some(FrameType::Headers)
            ]
        );
        let frames = capture.frames();
        assert!(!frames[1].flags.is_end_stream());
        assert!(frames[2].flags.is_end_stream());
    }

    #[test]
    fn test_completed_producer_released_while_item_alive() {
        let (writer, _capture) = capture_writer();
        let (producer, rx, _active) = producer(65_535);
        producer.write_headers(200, Headers::new()).unwrap();
        producer.finish(None).unwrap();
        assert!(!producer.is_released());

        let item = rx.recv().unwrap();
        let WorkItem::Produce(queued) = &item else {
            panic!("expected a produce item");
        };
        assert_eq!(produce(&writer, queued).unwrap(), Turn::Completed);
        assert_eq!(Arc::strong_count(&producer), 2);
        assert!(producer.is_released());
        drop(item);
    }

    #[test]
    fn test_stream_window_parks() {
        let (writer, capture) = capture_writer();
        let (producer, rx, _active) = producer(10);
        {
            let mut state = producer.lock();
            state.headers_sent = true;
            state.pending.extend_from_slice(&[1u8; 25]);
        }

        assert_eq!(produce(&writer, &producer).unwrap(), Turn::StreamParked);
        assert_eq!(capture.frames()[0].payload.len(), 10);
        assert!(rx.is_empty());

        // A stream WINDOW_UPDATE puts it back on the queue.
        assert!(producer.on_window_update(100));
        assert_eq!(rx.len(), 1);
        let _ = rx.recv().unwrap();
        assert_eq!(produce(&writer, &producer).unwrap(), Turn::Idle);
        assert_eq!(capture.frames()[1].payload.len(), 15);
    }

    #[test]
    fn test_connection_window_parks_until_update() {
        let (writer, _capture) = capture_writer();
        let (producer, rx, _active) = producer(1 << 20);
        {
            let mut state = producer.lock();
            state.headers_sent = true;
            state.pending.extend_from_slice(&vec![0u8; 70_000]);
        }

        // 65535 bytes of connection credit, one frame per turn
        let mut turns = Vec::new();
        loop {
            let turn = produce(&writer, &producer).unwrap();
            turns.push(turn);
            if turn != Turn::Requeue {
                break;
            }
            let _ = rx.recv().unwrap();
        }
        assert_eq!(turns.last(), Some(&Turn::ConnectionParked));
        assert_eq!(writer.connection_window(), 0);
        assert!(rx.is_empty());

        assert!(writer.update_connection_window(10_000));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_round_robin_requeue() {
        let (writer, capture) = capture_writer();
        let (tx, rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(2));
        let a = Arc::new(OutputProducer::new(1, 65_535, tx.clone(), Arc::clone(&active)));
        let b = Arc::new(OutputProducer::new(3, 65_535, tx, Arc::clone(&active)));
        for p in [&a, &b] {
            let mut state = p.lock();
            state.headers_sent = true;
            state.pending.extend_from_slice(&vec![0u8; 20_000]);
            state.end_requested = true;
            p.schedule(&mut state);
        }

        while let Ok(WorkItem::Produce(p)) = rx.try_recv() {
            produce(&writer, &p).unwrap();
        }

        let ids: Vec<u32> = capture.frames().iter().map(|f| f.stream_id).collect();
        assert_eq!(ids, vec![1, 3, 1, 3]);
        assert!(a.is_completed() && b.is_completed());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
