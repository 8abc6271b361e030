//! SunSpec device polling and data publishing.

use std::sync::Arc;
use std::time::Duration;

use sunspec_modbus::{CycleStats, DeviceSession, ModelDictionary, RegisterPort};
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::port::DevicePort;
use crate::publisher::{PublishStats, Publisher};

/// Error type for polling operations.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Failed to open device port: {0}")]
    Open(#[source] sunspec_modbus::Error),
    #[error("Scan failed: {0}")]
    Scan(#[source] sunspec_modbus::Error),
    #[error("Read failed: {0}")]
    Read(#[source] sunspec_modbus::Error),
    #[error("Publish failed: {0}")]
    Publish(#[from] sunspec_common::Error),
}

impl PollerError {
    /// Whether the poller should keep retrying after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PollerError::Open(_) => false,
            PollerError::Scan(e) | PollerError::Read(e) => e.is_recoverable(),
            PollerError::Publish(_) => true,
        }
    }
}

/// Result of one read-and-publish cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub read: CycleStats,
    pub published: PublishStats,
}

/// A poller for a single SunSpec device.
pub struct DevicePoller {
    device: DeviceConfig,
    dictionary: Arc<ModelDictionary>,
    publisher: Publisher,
}

impl DevicePoller {
    pub fn new(device: DeviceConfig, dictionary: Arc<ModelDictionary>, publisher: Publisher) -> Self {
        Self {
            device,
            dictionary,
            publisher,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// Open the device port and poll until a fatal error.
    pub async fn run(self) -> Result<(), PollerError> {
        let port = DevicePort::open(&self.device).map_err(PollerError::Open)?;
        info!(
            device = %self.device.name,
            port = port.kind(),
            interval_secs = self.device.poll_interval_secs,
            "Starting SunSpec poller"
        );
        self.run_with_port(port).await
    }

    /// Poll a device through an already opened port.
    pub async fn run_with_port<P: RegisterPort>(self, port: P) -> Result<(), PollerError> {
        let interval = self.device.poll_interval();
        let mut session = DeviceSession::new(port, self.dictionary.clone(), self.device.scan_options());

        self.scan_until_found(&mut session, interval).await?;

        loop {
            match self.poll_once(&mut session).await {
                Ok(report) => {
                    debug!(
                        device = %self.device.name,
                        models = report.read.models_read,
                        points = report.read.points.implemented,
                        published = report.published.success,
                        "Poll cycle complete"
                    );
                }
                Err(e) if e.is_recoverable() => {
                    warn!(device = %self.device.name, error = %e, "Poll cycle failed");
                }
                Err(e) => {
                    error!(device = %self.device.name, error = %e, "Stopping poller");
                    return Err(e);
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Scan the device, retrying recoverable failures every `interval`.
    pub async fn scan_until_found<P: RegisterPort>(
        &self,
        session: &mut DeviceSession<P>,
        interval: Duration,
    ) -> Result<(), PollerError> {
        loop {
            match self.scan(session).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!(
                        device = %self.device.name,
                        error = %e,
                        retry_secs = interval.as_secs(),
                        "SunSpec scan failed, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    error!(device = %self.device.name, error = %e, "Giving up on device");
                    return Err(e);
                }
            }
        }
    }

    /// Scan the device once and publish its identification.
    pub async fn scan<P: RegisterPort>(
        &self,
        session: &mut DeviceSession<P>,
    ) -> Result<(), PollerError> {
        session.scan().await.map_err(PollerError::Scan)?;

        info!(
            device = %self.device.name,
            base = ?session.base_address(),
            models = session.models().len(),
            "SunSpec device discovered"
        );

        if let Some(info) = session.info() {
            self.publisher.publish_info(&self.device.name, info).await?;
        }
        Ok(())
    }

    /// Read every model and publish the data tree and individual values.
    pub async fn poll_once<P: RegisterPort>(
        &self,
        session: &mut DeviceSession<P>,
    ) -> Result<CycleReport, PollerError> {
        let read = session.read_all().await.map_err(PollerError::Read)?;

        let name = &self.device.name;
        self.publisher.publish_data(name, &session.data_tree()).await?;
        let published = self.publisher.publish_values(name, &session.snapshot());

        if published.failed > 0 {
            warn!(device = %name, failed = published.failed, "Some values were not published");
        }

        Ok(CycleReport { read, published })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunspec_common::Format;
    use sunspec_modbus::{Error, MemoryPort};

    fn poller() -> DevicePoller {
        DevicePoller::new(
            DeviceConfig::default(),
            ModelDictionary::builtin(),
            Publisher::log_only("sunspec", Format::Json),
        )
    }

    fn session(port: MemoryPort) -> DeviceSession<MemoryPort> {
        DeviceSession::new(port, ModelDictionary::builtin(), DeviceConfig::default().scan_options())
    }

    fn inverter_image() -> MemoryPort {
        let mut inverter = vec![0u16; 50];
        inverter[1] = 2345; // AphA
        inverter[4] = (-2i16) as u16; // A_SF
        MemoryPort::builder(40000)
            .marker()
            .model(1, &[0; 66])
            .model(103, &inverter)
            .end()
            .build()
    }

    #[tokio::test]
    async fn test_scan_and_poll() {
        let poller = poller();
        let mut session = session(inverter_image());

        poller.scan(&mut session).await.unwrap();
        let report = poller.poll_once(&mut session).await.unwrap();

        assert_eq!(report.read.models_read, 2);
        assert_eq!(report.read.models_failed, 0);
        assert_eq!(session.data_tree()["inverter_three_phase_0"]["AphA"], 23.45);
    }

    #[tokio::test]
    async fn test_not_sunspec_is_fatal() {
        let poller = poller();
        let mut session = session(MemoryPort::new(40000, vec![0; 4]));

        let err = poller
            .scan_until_found(&mut session, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PollerError::Scan(Error::NotSunSpecDevice { .. })));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_link_failure_is_recoverable() {
        let poller = poller();
        let mut session = session(inverter_image());
        poller.scan(&mut session).await.unwrap();

        session.port_mut().set_link_down(true);
        let err = poller.poll_once(&mut session).await.unwrap_err();
        assert!(matches!(err, PollerError::Read(Error::Transport(_))));
        assert!(err.is_recoverable());

        session.port_mut().set_link_down(false);
        assert!(poller.poll_once(&mut session).await.is_ok());
    }

    #[tokio::test]
    async fn test_poll_before_scan() {
        let poller = poller();
        let mut session = session(inverter_image());

        let err = poller.poll_once(&mut session).await.unwrap_err();
        assert!(matches!(err, PollerError::Read(Error::NotScanned)));
    }

    #[test]
    fn test_open_error_is_fatal() {
        let err = PollerError::Open(Error::NotScanned);
        assert!(!err.is_recoverable());
    }
}
