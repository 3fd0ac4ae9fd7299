use std::future::Future;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::transport::{DeviceInfo, Region, Transport, TransportError, TransportOp};

/// Bounds `fut` by `limit`, turning expiry into a timeout of `op`.
async fn bounded<R, Fut>(op: TransportOp, limit: Duration, fut: Fut) -> Result<R, Error>
where
    Fut: Future<Output = Result<R, TransportError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::from(TransportError::Timeout(op, limit))),
    }
}

/// Like [`bounded`], but gives up as soon as `cancel` is triggered.
async fn interruptible<R, Fut>(
    op: TransportOp,
    limit: Duration,
    cancel: &CancelToken,
    fut: Fut,
) -> Result<R, Error>
where
    Fut: Future<Output = Result<R, TransportError>>,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            debug!("Interrupted device {} on cancellation", op);
            Err(Error::CancelledByUser)
        }
        result = bounded(op, limit, fut) => result,
    }
}

/// A transport borrowed for the duration of one run.
///
/// Every call is bounded by the configured timeout and, apart from the teardown calls, interrupted
/// by cancellation. The link remembers whether it has to be disconnected when the run ends.
pub(crate) struct Link<'a, T> {
    transport: &'a mut T,
    timeout: Duration,
    cancel: CancelToken,
    connected: bool,
}

impl<'a, T: Transport> Link<'a, T> {
    pub fn new(transport: &'a mut T, timeout: Duration, cancel: CancelToken) -> Self {
        Link {
            transport,
            timeout,
            cancel,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn connect(&mut self) -> Result<DeviceInfo, Error> {
        let info = interruptible(
            TransportOp::Connect,
            self.timeout,
            &self.cancel,
            self.transport.connect(),
        )
        .await?;
        self.connected = true;

        Ok(info)
    }

    pub async fn read(&mut self, offset: u32, length: usize) -> Result<Vec<u8>, Error> {
        let data = interruptible(
            TransportOp::Read,
            self.timeout,
            &self.cancel,
            self.transport.read(offset, length),
        )
        .await?;

        if data.len() != length {
            return Err(Error::from(TransportError::Failed(
                TransportOp::Read,
                format!("expected {} bytes, got {}", length, data.len()),
            )));
        }

        Ok(data)
    }

    /// Writes `data` at `offset` and checks that the device accepted all of it.
    pub async fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let ack = interruptible(
            TransportOp::Write,
            self.timeout,
            &self.cancel,
            self.transport.write(offset, data),
        )
        .await?;

        if ack.written != data.len() {
            return Err(Error::from(TransportError::ShortWrite {
                offset,
                acknowledged: ack.written,
                expected: data.len(),
            }));
        }

        trace!("Wrote {} bytes at {:#010x}", data.len(), offset);

        Ok(())
    }

    pub async fn erase(&mut self, region: Region) -> Result<(), Error> {
        interruptible(
            TransportOp::Erase,
            self.timeout,
            &self.cancel,
            self.transport.erase(region),
        )
        .await
    }

    pub async fn activate(&mut self, region: Region) -> Result<(), Error> {
        interruptible(
            TransportOp::Activate,
            self.timeout,
            &self.cancel,
            self.transport.activate(region),
        )
        .await
    }

    /// Asks the device to abort, returning whether it confirmed a clean abort.
    pub async fn abort(&mut self) -> bool {
        match bounded(TransportOp::Abort, self.timeout, self.transport.abort()).await {
            Ok(clean) => clean,
            Err(err) => {
                warn!("Could not abort the device operation: {}", err);
                false
            }
        }
    }

    /// Disconnects if the link was opened. Failures are logged, since the run is already over.
    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }

        self.connected = false;

        if let Err(err) = bounded(
            TransportOp::Disconnect,
            self.timeout,
            self.transport.disconnect(),
        )
        .await
        {
            warn!("Could not disconnect from the device: {}", err);
        }
    }
}
