#![allow(unused)]
//! FTMS/CSC BLE Integration Tests
//!
//! Requires:
//! - Two BLE adapters (hci0 for server, hci1 for client)
//! - trainer-daemon running on hci0 (`--simulate` is enough)
//! - TRAINER_NAME set if the config changes the device name
//!
//! Run: cargo test --test integration -- --ignored --test-threads=1

use bluer::{Adapter, AdapterEvent, Device};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

use trainer_core::protocol::{
    decode_csc_measurement, decode_indoor_bike_data, CONTROL_POINT_UUID, CSC_FEATURE_UUID,
    CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, FEATURE_UUID, FTMS_SERVICE_UUID, INCLINE_RANGE_UUID,
    INDOOR_BIKE_DATA_UUID, RESISTANCE_RANGE_UUID,
};

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Helper: get hci1 adapter for client-side scanning
async fn get_test_adapter() -> bluer::Result<Adapter> {
    let session = bluer::Session::new().await?;
    session.adapter("hci1")
}

fn device_name() -> String {
    std::env::var("TRAINER_NAME").unwrap_or_else(|_| "Pico Bike".to_string())
}

/// Helper: scan for the trainer and connect
async fn find_and_connect(adapter: &Adapter) -> bluer::Result<Device> {
    adapter.set_powered(true).await?;

    let filter = bluer::DiscoveryFilter {
        uuids: std::collections::HashSet::from([FTMS_SERVICE_UUID]),
        ..Default::default()
    };
    adapter.set_discovery_filter(filter).await?;

    let mut events = adapter.discover_devices().await?;

    let device = timeout(SCAN_TIMEOUT, async {
        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
                let device = adapter.device(addr)?;
                if let Ok(Some(name)) = device.name().await {
                    if name.starts_with(&device_name()) {
                        return Ok::<_, bluer::Error>(device);
                    }
                }
            }
        }
        Err(bluer::Error::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found during scan", device_name()),
        )))
    })
    .await
    .map_err(|_| {
        bluer::Error::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "BLE scan timed out",
        ))
    })??;

    timeout(CONNECT_TIMEOUT, device.connect())
        .await
        .map_err(|_| {
            bluer::Error::from(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "BLE connect timed out",
            ))
        })??;

    Ok(device)
}

/// Helper: find a characteristic by UUID on a connected device
async fn find_char(
    device: &Device,
    service_uuid: uuid::Uuid,
    char_uuid: uuid::Uuid,
) -> bluer::Result<bluer::gatt::remote::Characteristic> {
    let services = device.services().await?;
    for svc in &services {
        if svc.uuid().await? == service_uuid {
            let chars = svc.characteristics().await?;
            for ch in &chars {
                if ch.uuid().await? == char_uuid {
                    return Ok(ch.clone());
                }
            }
        }
    }
    Err(bluer::Error::from(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("Characteristic {:?} not found", char_uuid),
    )))
}

#[tokio::test]
#[ignore]
async fn test_discovery() {
    let adapter = get_test_adapter().await.expect("Need hci1 adapter");

    adapter.set_powered(true).await.expect("Power on hci1");
    let filter = bluer::DiscoveryFilter {
        uuids: std::collections::HashSet::from([FTMS_SERVICE_UUID]),
        ..Default::default()
    };
    adapter
        .set_discovery_filter(filter)
        .await
        .expect("Set filter");

    let mut events = adapter.discover_devices().await.expect("Start discovery");

    let found = timeout(SCAN_TIMEOUT, async {
        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
                let device = adapter.device(addr).expect("Get device");
                if let Ok(Some(name)) = device.name().await {
                    if name.starts_with(&device_name()) {
                        return true;
                    }
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    assert!(found, "Should find '{}' advertising FTMS", device_name());
}

#[tokio::test]
#[ignore]
async fn test_read_feature() {
    let adapter = get_test_adapter().await.expect("Need hci1 adapter");
    let device = find_and_connect(&adapter)
        .await
        .expect("Should find and connect to the trainer");

    let ch = find_char(&device, FTMS_SERVICE_UUID, FEATURE_UUID)
        .await
        .expect("Should have Feature characteristic");

    let data = ch.read().await.expect("Should read Feature");
    assert_eq!(data, vec![0x8e, 0x10, 0x00, 0x00, 0x0e, 0x20, 0x00, 0x00]);

    device.disconnect().await.ok();
}

#[tokio::test]
#[ignore]
async fn test_read_ranges() {
    let adapter = get_test_adapter().await.expect("Need hci1 adapter");
    let device = find_and_connect(&adapter)
        .await
        .expect("Should find and connect to the trainer");

    for (uuid, expected) in [
        (RESISTANCE_RANGE_UUID, (10i16, 1000i16, 10u16)),
        (INCLINE_RANGE_UUID, (-200, 200, 10)),
    ] {
        let ch = find_char(&device, FTMS_SERVICE_UUID, uuid)
            .await
            .expect("Should have range characteristic");
        let data = ch.read().await.expect("Should read range");
        assert_eq!(data.len(), 6, "Range should be 6 bytes");

        let min = i16::from_le_bytes([data[0], data[1]]);
        let max = i16::from_le_bytes([data[2], data[3]]);
        let step = u16::from_le_bytes([data[4], data[5]]);
        assert_eq!((min, max, step), expected);
    }

    device.disconnect().await.ok();
}

#[tokio::test]
#[ignore]
async fn test_indoor_bike_data_notifications() {
    let adapter = get_test_adapter().await.expect("Need hci1 adapter");
    let device = find_and_connect(&adapter)
        .await
        .expect("Should find and connect to the trainer");

    let ch = find_char(&device, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID)
        .await
        .expect("Should have Indoor Bike Data characteristic");
    let notes = ch.notify().await.expect("Subscribe to Indoor Bike Data");
    futures::pin_mut!(notes);

    for _ in 0..3 {
        let data = timeout(Duration::from_secs(3), notes.next())
            .await
            .expect("Notification within 3 s")
            .expect("Notification stream open");
        let decoded = decode_indoor_bike_data(&data).expect("Well-formed Indoor Bike Data");
        assert!(decoded.speed.is_some());
        assert!(decoded.cadence.is_some());
        assert!(decoded.resistance.is_some());
    }

    device.disconnect().await.ok();
}

#[tokio::test]
#[ignore]
async fn test_csc_service() {
    let adapter = get_test_adapter().await.expect("Need hci1 adapter");
    let device = find_and_connect(&adapter)
        .await
        .expect("Should find and connect to the trainer");

    let feature = find_char(&device, CSC_SERVICE_UUID, CSC_FEATURE_UUID)
        .await
        .expect("Should have CSC Feature characteristic");
    assert_eq!(feature.read().await.expect("Read CSC Feature"), vec![0x03, 0x00]);

    let ch = find_char(&device, CSC_SERVICE_UUID, CSC_MEASUREMENT_UUID)
        .await
        .expect("Should have CSC Measurement characteristic");
    let notes = ch.notify().await.expect("Subscribe to CSC Measurement");
    futures::pin_mut!(notes);
    let data = timeout(Duration::from_secs(3), notes.next())
        .await
        .expect("Notification within 3 s")
        .expect("Notification stream open");
    assert!(decode_csc_measurement(&data).is_some());

    device.disconnect().await.ok();
}

#[tokio::test]
#[ignore]
async fn test_control_point_request_control() {
    let adapter = get_test_adapter().await.expect("Need hci1 adapter");
    let device = find_and_connect(&adapter)
        .await
        .expect("Should find and connect to the trainer");

    let ch = find_char(&device, FTMS_SERVICE_UUID, CONTROL_POINT_UUID)
        .await
        .expect("Should have Control Point characteristic");
    let indications = ch.notify().await.expect("Enable Control Point indications");
    futures::pin_mut!(indications);

    for (request, expected) in [
        (vec![0x07], vec![0x80, 0x07, 0x05]),
        (vec![0x00], vec![0x80, 0x00, 0x01]),
        (vec![0x04, 0x26, 0x02], vec![0x80, 0x04, 0x01]),
        (vec![0x01], vec![0x80, 0x01, 0x01]),
    ] {
        ch.write(&request).await.expect("Control Point write");
        let response = timeout(Duration::from_secs(3), indications.next())
            .await
            .expect("Indication within 3 s")
            .expect("Indication stream open");
        assert_eq!(response, expected, "request {:02x?}", request);
    }

    device.disconnect().await.ok();
}
