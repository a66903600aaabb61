//! Arduino environmental sensor board.
//!
//! The board carries a BME680 (temperature, pressure, humidity) and an SHT
//! sensor (temperature, humidity) and answers single-character requests:
//!
//! | request | reply                                  | bank   |
//! |---------|----------------------------------------|--------|
//! | `T`     | `21.50 *C, 1013.25 hPa, 45.20 %\r\n`    | `ARD0` |
//! | `R`     | `21.40 *C, 44.80 %\r\n`                 | `ARD1` |
//!
//! `ARD0` is ordered temperature, humidity, pressure. Any failure aborts the
//! whole cycle.

use super::{link, open_serial_from_settings, with_context, Equipment, EquipmentCommon};
use crate::error::AppResult;
use crate::host::{Event, HostBus, OdbValue};
use crate::parser::ResponseTemplate;
use crate::transport::Transport;
use async_trait::async_trait;
use tracing::{debug, info};

/// Equipment name registered with the host.
pub const EQUIPMENT_NAME: &str = "ArduinoEquipment";

const BME_REQUEST: &str = "T";
const SHT_REQUEST: &str = "R";
const BME_TEMPLATE: &str = "{temperature:f} *C, {pressure:f} hPa, {humidity:f} %\r\n";
const SHT_TEMPLATE: &str = "{temperature:f} *C, {humidity:f} %\r\n";

/// Sensor board equipment.
pub struct ArduinoEquipment {
    common: EquipmentCommon,
    transport: Option<Box<dyn Transport>>,
    bme: ResponseTemplate,
    sht: ResponseTemplate,
}

impl ArduinoEquipment {
    /// Equipment that opens its serial port from the settings on connect.
    pub fn new() -> AppResult<Self> {
        Ok(Self {
            common: EquipmentCommon::periodic(500, 60_000),
            transport: None,
            bme: ResponseTemplate::compile(BME_TEMPLATE)?,
            sht: ResponseTemplate::compile(SHT_TEMPLATE)?,
        })
    }

    /// Uses `transport` instead of opening a serial port.
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    async fn read_bme(&mut self) -> AppResult<Vec<f64>> {
        let reply = link(&mut self.transport)?
            .query(BME_REQUEST)
            .await
            .map_err(|e| with_context(e, "reading bme measurement"))?;
        let fields = self.bme.parse(&reply)?;
        Ok(vec![
            fields.require("temperature")?,
            fields.require("humidity")?,
            fields.require("pressure")?,
        ])
    }

    async fn read_sht(&mut self) -> AppResult<Vec<f64>> {
        let reply = link(&mut self.transport)?
            .query(SHT_REQUEST)
            .await
            .map_err(|e| with_context(e, "reading sht measurement"))?;
        let fields = self.sht.parse(&reply)?;
        Ok(vec![fields.require("temperature")?, fields.require("humidity")?])
    }
}

#[async_trait]
impl Equipment for ArduinoEquipment {
    fn name(&self) -> &str {
        EQUIPMENT_NAME
    }

    fn common(&self) -> &EquipmentCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EquipmentCommon {
        &mut self.common
    }

    fn default_settings(&self) -> Vec<(&'static str, OdbValue)> {
        vec![
            ("Serial Port", "/dev/ttyUSB0".into()),
            ("Serial Speed", OdbValue::Int(115_200)),
            (
                "Names ARD0",
                vec!["Temperature", "Humidity", "Atmospheric Pressure"].into(),
            ),
            ("Unit ARD0", vec!["C", "%", "hPa"].into()),
            ("Names ARD1", vec!["Temperature", "Humidity"].into()),
            ("Unit ARD1", vec!["C", "%"].into()),
        ]
    }

    async fn connect(&mut self, host: &dyn HostBus) -> AppResult<()> {
        if self.transport.is_none() {
            self.transport = Some(open_serial_from_settings(host, &self.settings_dir())?);
        }
        if let Some(transport) = &self.transport {
            info!(equipment = EQUIPMENT_NAME, link = %transport.describe(), "connected");
        }
        Ok(())
    }

    async fn poll(&mut self, _host: &dyn HostBus) -> AppResult<Option<Event>> {
        let ard0 = self.read_bme().await?;
        let ard1 = self.read_sht().await?;
        debug!(equipment = EQUIPMENT_NAME, ?ard0, ?ard1, "sensors read");

        let mut event = self.new_event();
        event.create_bank("ARD0", ard0)?;
        event.create_bank("ARD1", ard1)?;
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use crate::transport::MockTransport;

    fn board() -> (ArduinoEquipment, MockTransport) {
        let mock = MockTransport::new("arduino");
        let equipment = ArduinoEquipment::new()
            .unwrap()
            .with_transport(Box::new(mock.clone()));
        (equipment, mock)
    }

    #[tokio::test]
    async fn poll_builds_both_banks() {
        let (mut equipment, mock) = board();
        mock.respond("T", "21.50 *C, 1013.25 hPa, 45.20 %\r\n")
            .respond("R", "21.40 *C, 44.80 %\r\n");
        let (host, _rx) = LocalHost::in_memory();

        let event = equipment.poll(&host).await.unwrap().unwrap();
        assert_eq!(event.header.event_id, 500);
        assert_eq!(event.bank("ARD0").unwrap().data(), &[21.5, 45.2, 1013.25]);
        assert_eq!(event.bank("ARD1").unwrap().data(), &[21.4, 44.8]);
        assert_eq!(mock.written(), ["T", "R"]);
    }

    #[tokio::test]
    async fn repeated_polls_give_identical_banks() {
        let (mut equipment, mock) = board();
        mock.respond("T", "21.50 *C, 1013.25 hPa, 45.20 %\r\n")
            .respond("R", "21.40 *C, 44.80 %\r\n");
        let (host, _rx) = LocalHost::in_memory();

        let first = equipment.poll(&host).await.unwrap().unwrap();
        let second = equipment.poll(&host).await.unwrap().unwrap();
        assert_eq!(first.banks(), second.banks());
        assert_eq!(first.header.event_id, second.header.event_id);
        assert_eq!(mock.written(), ["T", "R", "T", "R"]);
    }

    #[tokio::test]
    async fn malformed_reply_aborts_cycle() {
        let (mut equipment, mock) = board();
        mock.respond("T", "21.50 C, 1013.25 hPa, 45.20 %\r\n")
            .respond("R", "21.40 *C, 44.80 %\r\n");
        let (host, _rx) = LocalHost::in_memory();

        let err = equipment.poll(&host).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
        // The SHT request is never sent once the BME reply is rejected.
        assert_eq!(mock.written(), ["T"]);
    }

    #[tokio::test]
    async fn silence_is_a_parse_failure() {
        let (mut equipment, _mock) = board();
        let (host, _rx) = LocalHost::in_memory();
        assert!(equipment.poll(&host).await.is_err());
    }

    #[tokio::test]
    async fn unconnected_poll_fails_cleanly() {
        let mut equipment = ArduinoEquipment::new().unwrap();
        let (host, _rx) = LocalHost::in_memory();
        let err = equipment.poll(&host).await.unwrap_err();
        assert!(err.is_transport());
    }
}
