//! Trellis Multi-Route Transport Layer
//!
//! Frames for one destination may travel over any of several concurrent
//! transports. This crate holds the transport descriptors, the
//! copy-on-write route registry, and the writer/reader pair that
//! load-balance and merge across routes.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod manager;
pub mod reader;
pub mod transport;
pub mod writer;

pub use error::{Result, RouteError};
pub use manager::{RouteManager, TransportEntry};
pub use reader::MultiRouteReader;
pub use transport::{Route, RouteStats, StaticTransport, Transport};
pub use writer::MultiRouteWriter;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use trellis_core::{Id, TransferPath};

    use super::*;

    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    fn manager_with_transports(destination: TransferPath, count: usize) -> Arc<RouteManager> {
        let manager = Arc::new(RouteManager::new());
        for i in 0..count {
            manager.update_transport(
                Arc::new(StaticTransport::new(format!("transport-{i}"), destination)),
                vec![Route::new(16)],
            );
        }
        manager
    }

    #[tokio::test]
    async fn test_many_routes_deliver_all_frames() {
        // Frames fan out across duplicated transports and merge back in
        // arbitrary order; every value must still arrive exactly once.
        let destination = TransferPath::to_destination(Id::new());
        let manager = manager_with_transports(destination, 8);

        let writer = manager.open_multi_route_writer(destination);
        let mut reader = manager.open_multi_route_reader(destination);

        const COUNT: u64 = 512;
        let write_task = tokio::spawn(async move {
            for value in 0..COUNT {
                let frame = Bytes::copy_from_slice(&value.to_le_bytes());
                writer.write(frame, WRITE_TIMEOUT).await.unwrap();
            }
        });

        let mut values = Vec::with_capacity(COUNT as usize);
        for _ in 0..COUNT {
            let frame = reader.read(READ_TIMEOUT).await.unwrap();
            let bytes: [u8; 8] = frame.as_ref().try_into().unwrap();
            values.push(u64::from_le_bytes(bytes));
        }
        write_task.await.unwrap();

        values.sort_unstable();
        assert_eq!(values, (0..COUNT).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_write_times_out_without_routes() {
        let destination = TransferPath::to_destination(Id::new());
        let manager = Arc::new(RouteManager::new());
        let writer = manager.open_multi_route_writer(destination);

        let err = writer
            .write(Bytes::from_static(b"frame"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::WriteTimeout));
    }

    #[tokio::test]
    async fn test_write_unblocks_on_transport_arrival() {
        let destination = TransferPath::to_destination(Id::new());
        let manager = Arc::new(RouteManager::new());
        let writer = manager.open_multi_route_writer(destination);

        let late_manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            late_manager.update_transport(
                Arc::new(StaticTransport::new("late", destination)),
                vec![Route::new(4)],
            );
        });

        writer
            .write(Bytes::from_static(b"frame"), WRITE_TIMEOUT)
            .await
            .unwrap();

        let mut reader = manager.open_multi_route_reader(destination);
        assert_eq!(
            reader.read(READ_TIMEOUT).await.unwrap(),
            Bytes::from_static(b"frame")
        );
    }

    #[tokio::test]
    async fn test_removed_transport_stops_delivering() {
        let destination = TransferPath::to_destination(Id::new());
        let manager = manager_with_transports(destination, 1);

        let writer = manager.open_multi_route_writer(destination);
        let mut reader = manager.open_multi_route_reader(destination);

        writer
            .write(Bytes::from_static(b"first"), WRITE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            reader.read(READ_TIMEOUT).await.unwrap(),
            Bytes::from_static(b"first")
        );

        manager.remove_transport("transport-0");
        tokio::task::yield_now().await;

        let err = writer
            .write(Bytes::from_static(b"second"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::WriteTimeout));
        assert!(matches!(
            reader.read(Duration::from_millis(20)).await,
            Err(RouteError::ReadTimeout)
        ));
    }

    #[tokio::test]
    async fn test_reader_timeout_when_quiet() {
        let destination = TransferPath::to_destination(Id::new());
        let manager = manager_with_transports(destination, 2);
        let mut reader = manager.open_multi_route_reader(destination);

        assert!(matches!(
            reader.read(Duration::from_millis(20)).await,
            Err(RouteError::ReadTimeout)
        ));
    }
}
