//! BLE GATT server for the FTMS indoor bike profile plus Cycling Speed and
//! Cadence.
//!
//! Advertises under the configured name (with the pairing suffix while a
//! pairing window is open) and exposes FTMS (0x1826) and CSC (0x1816) so
//! apps like Zwift or a bike computer can read speed/cadence and drive the
//! resistance. Control Point writes are forwarded to the control loop as
//! events; everything read or notified comes from the telemetry snapshot.

use std::pin::Pin;
use std::time::Duration;

use bluer::{
    adv::{Advertisement, AdvertisementHandle},
    gatt::local::{
        characteristic_control, Application, Characteristic, CharacteristicControlEvent,
        CharacteristicNotifier, CharacteristicNotify, CharacteristicNotifyMethod,
        CharacteristicRead, CharacteristicWrite, CharacteristicWriteMethod, Service,
    },
    Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty,
};
use futures::{pin_mut, Future, FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::protocol::{
    self, CONTROL_POINT_UUID, CSC_FEATURE_UUID, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID,
    FEATURE_UUID, FTMS_SERVICE_UUID, INCLINE_RANGE_UUID, INDOOR_BIKE_DATA_UUID,
    MACHINE_STATUS_UUID, RESISTANCE_RANGE_UUID, TRAINING_STATUS_UUID,
};
use crate::session::PeerId;
use crate::trainer::{Notification, Telemetry, TrainerEvent};

type NotifyFn = Box<
    dyn Fn(CharacteristicNotifier) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Channels into and out of the control loop.
pub struct BleContext {
    pub events: mpsc::Sender<TrainerEvent>,
    pub telemetry: watch::Receiver<Telemetry>,
    pub notifications: broadcast::Sender<Notification>,
    pub notify_interval: Duration,
}

impl From<Address> for PeerId {
    fn from(addr: Address) -> Self {
        PeerId(addr.0)
    }
}

/// Run the BLE GATT server until the adapter goes away.
pub async fn run(ctx: BleContext) -> bluer::Result<()> {
    let BleContext {
        events,
        mut telemetry,
        notifications,
        notify_interval,
    } = ctx;

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    info!(
        "FTMS using adapter {} ({})",
        adapter.name(),
        adapter.address().await?
    );

    // --- Advertisement ---
    let mut advertised_name = telemetry.borrow().advertised_name.clone();
    let mut adv_handle = Some(advertise(&adapter, &advertised_name).await?);

    // --- Periodic data notifications ---
    let ibd_notify_fn = periodic_notify_fn("Indoor Bike Data", telemetry.clone(), notify_interval, |t| {
        protocol::encode_indoor_bike_data(&t.indoor_bike_data())
    });
    let csc_notify_fn = periodic_notify_fn("CSC Measurement", telemetry.clone(), notify_interval, |t| {
        t.csc_measurement()
    });

    // --- Status notifications (pushed by the control loop) ---
    let machine_status_notify_fn = status_notify_fn(
        "Machine Status",
        notifications.clone(),
        None,
        |n| matches!(n, Notification::MachineStatus(_)),
    );
    let training_tel = telemetry.clone();
    let training_status_notify_fn = status_notify_fn(
        "Training Status",
        notifications.clone(),
        Some(Box::new(move || {
            protocol::encode_training_status(training_tel.borrow().training_status())
        })),
        |n| matches!(n, Notification::TrainingStatus(_)),
    );

    // --- Control Point ---
    // IO mode: writes arrive on a reader, indications go out on a writer.
    let (cp_control, cp_handle) = characteristic_control();

    let training_read_tel = telemetry.clone();
    let app = Application {
        services: vec![
            Service {
                uuid: FTMS_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    // Fitness Machine Feature (0x2ACC) -- Read
                    Characteristic {
                        uuid: FEATURE_UUID,
                        read: Some(static_read("Feature", protocol::encode_feature().to_vec())),
                        ..Default::default()
                    },
                    // Indoor Bike Data (0x2AD2) -- Notify
                    Characteristic {
                        uuid: INDOOR_BIKE_DATA_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(ibd_notify_fn),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    // Supported Resistance Level Range (0x2AD6) -- Read
                    Characteristic {
                        uuid: RESISTANCE_RANGE_UUID,
                        read: Some(static_read(
                            "Resistance range",
                            protocol::encode_resistance_range().to_vec(),
                        )),
                        ..Default::default()
                    },
                    // Supported Inclination Range (0x2AD5) -- Read
                    Characteristic {
                        uuid: INCLINE_RANGE_UUID,
                        read: Some(static_read(
                            "Incline range",
                            protocol::encode_incline_range().to_vec(),
                        )),
                        ..Default::default()
                    },
                    // Training Status (0x2AD3) -- Read + Notify
                    Characteristic {
                        uuid: TRAINING_STATUS_UUID,
                        read: Some(CharacteristicRead {
                            read: true,
                            fun: Box::new(move |_req| {
                                let status = training_read_tel.borrow().training_status();
                                async move {
                                    debug!("Training Status read");
                                    Ok(protocol::encode_training_status(status))
                                }
                                .boxed()
                            }),
                            ..Default::default()
                        }),
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(training_status_notify_fn),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    // Fitness Machine Control Point (0x2AD9) -- Write + Indicate
                    Characteristic {
                        uuid: CONTROL_POINT_UUID,
                        write: Some(CharacteristicWrite {
                            write: true,
                            method: CharacteristicWriteMethod::Io,
                            ..Default::default()
                        }),
                        notify: Some(CharacteristicNotify {
                            indicate: true,
                            method: CharacteristicNotifyMethod::Io,
                            ..Default::default()
                        }),
                        control_handle: cp_handle,
                        ..Default::default()
                    },
                    // Fitness Machine Status (0x2ADA) -- Notify
                    Characteristic {
                        uuid: MACHINE_STATUS_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(machine_status_notify_fn),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            Service {
                uuid: CSC_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    // CSC Measurement (0x2A5B) -- Notify
                    Characteristic {
                        uuid: CSC_MEASUREMENT_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(csc_notify_fn),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    // CSC Feature (0x2A5C) -- Read
                    Characteristic {
                        uuid: CSC_FEATURE_UUID,
                        read: Some(static_read(
                            "CSC Feature",
                            protocol::encode_csc_feature().to_vec(),
                        )),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    let _app_handle = adapter.serve_gatt_application(app).await?;
    info!("FTMS + CSC GATT services registered");

    // --- Connection monitor ---
    for addr in adapter.device_addresses().await? {
        watch_device(&adapter, addr, events.clone());
    }
    let adapter_events = adapter.events().await?;
    pin_mut!(adapter_events);

    // --- Control Point event loop ---
    let mut cp_reader: Option<bluer::gatt::CharacteristicReader> = None;
    let mut cp_writer: Option<bluer::gatt::CharacteristicWriter> = None;
    let mut cp_peer: Option<PeerId> = None;
    let mut read_buf = Vec::new();

    pin_mut!(cp_control);

    info!("FTMS service running");

    loop {
        tokio::select! {
            // Handle control point IO events (new subscriber or writer)
            evt = cp_control.next() => {
                match evt {
                    Some(CharacteristicControlEvent::Write(req)) => {
                        info!(
                            "Control Point write session from {} (MTU {})",
                            req.device_address(), req.mtu()
                        );
                        cp_peer = Some(req.device_address().into());
                        read_buf = vec![0u8; req.mtu()];
                        match req.accept() {
                            Ok(reader) => cp_reader = Some(reader),
                            Err(e) => error!("Failed to accept CP write: {}", e),
                        }
                    }
                    Some(CharacteristicControlEvent::Notify(notifier)) => {
                        info!(
                            "Control Point indicate session from {} (MTU {})",
                            notifier.device_address(), notifier.mtu()
                        );
                        cp_writer = Some(notifier);
                    }
                    None => {
                        info!("Control Point control stream ended");
                        break;
                    }
                }
            }

            // Read incoming control point writes
            read_res = async {
                match &mut cp_reader {
                    Some(reader) => reader.read(&mut read_buf).await,
                    None => futures::future::pending().await,
                }
            } => {
                match read_res {
                    Ok(0) => {
                        info!("Control Point write stream ended");
                        cp_reader = None;
                    }
                    Ok(n) => {
                        let bytes = read_buf[..n].to_vec();
                        debug!("Control Point write: {} bytes {:02x?}", n, bytes);
                        let Some(peer) = cp_peer else {
                            warn!("Control Point write with no known sender");
                            continue;
                        };

                        let (reply, response) = oneshot::channel();
                        if events
                            .send(TrainerEvent::ControlPoint { peer, data: bytes, reply })
                            .await
                            .is_err()
                        {
                            error!("Control loop gone, stopping FTMS service");
                            break;
                        }
                        let Ok(response) = response.await else {
                            warn!("Control Point command dropped without a response");
                            continue;
                        };

                        // Datagram socket: one write is one indication.
                        if let Some(writer) = cp_writer.as_mut() {
                            if let Err(e) = writer.write(&response).await {
                                warn!("Control Point indication error: {}", e);
                                cp_writer = None;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Control Point read error: {}", e);
                        cp_reader = None;
                    }
                }
            }

            // Re-advertise when the name changes (pairing window open/close)
            changed = telemetry.changed() => {
                if changed.is_err() {
                    info!("Telemetry channel closed, stopping FTMS service");
                    break;
                }
                let name = telemetry.borrow_and_update().advertised_name.clone();
                if name != advertised_name {
                    // Drop the old registration before adding the new one.
                    adv_handle = None;
                    match advertise(&adapter, &name).await {
                        Ok(handle) => adv_handle = Some(handle),
                        Err(e) => error!("Failed to re-advertise as '{}': {}", name, e),
                    }
                    advertised_name = name;
                }
            }

            // New devices get a connection watcher
            evt = adapter_events.next() => {
                match evt {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        watch_device(&adapter, addr, events.clone());
                    }
                    Some(_) => {}
                    None => {
                        warn!("Adapter event stream ended");
                        break;
                    }
                }
            }
        }
    }

    drop(adv_handle);
    Ok(())
}

async fn advertise(adapter: &Adapter, name: &str) -> bluer::Result<AdvertisementHandle> {
    adapter.set_alias(name.to_string()).await?;
    // FTMS spec Section 3.1: Service Data carries Flags (available) + Machine Type
    let adv = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: vec![FTMS_SERVICE_UUID, CSC_SERVICE_UUID].into_iter().collect(),
        service_data: [(FTMS_SERVICE_UUID, protocol::encode_advertising_data())]
            .into_iter()
            .collect(),
        local_name: Some(name.to_string()),
        discoverable: Some(true),
        ..Default::default()
    };
    let handle = adapter.advertise(adv).await?;
    info!("Advertising as '{}' with FTMS + CSC services", name);
    Ok(handle)
}

/// Turn the device's `Connected` property into connect/disconnect events.
fn watch_device(adapter: &Adapter, addr: Address, events: mpsc::Sender<TrainerEvent>) {
    let device = match adapter.device(addr) {
        Ok(device) => device,
        Err(e) => {
            warn!("Cannot watch device {}: {}", addr, e);
            return;
        }
    };
    tokio::spawn(async move {
        let peer = PeerId::from(addr);
        if device.is_connected().await.unwrap_or(false) {
            let _ = events.send(TrainerEvent::Connected(peer)).await;
        }
        let stream = match device.events().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("No property events for {}: {}", addr, e);
                return;
            }
        };
        pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
                let event = if connected {
                    TrainerEvent::Connected(peer)
                } else {
                    TrainerEvent::Disconnected(peer)
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
        debug!("Stopped watching {}", addr);
    });
}

fn static_read(name: &'static str, value: Vec<u8>) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |_req| {
            let value = value.clone();
            async move {
                debug!("{} characteristic read", name);
                Ok(value)
            }
            .boxed()
        }),
        ..Default::default()
    }
}

/// Notify session that samples the telemetry snapshot every `interval`
/// until the client unsubscribes.
fn periodic_notify_fn(
    name: &'static str,
    telemetry: watch::Receiver<Telemetry>,
    interval: Duration,
    encode: fn(&Telemetry) -> Vec<u8>,
) -> NotifyFn {
    Box::new(move |notifier| {
        let telemetry = telemetry.clone();
        async move {
            tokio::spawn(async move {
                info!(
                    "{} notification session started (confirming={})",
                    name,
                    notifier.confirming()
                );
                let mut notifier = notifier;
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;

                    if notifier.is_stopped() {
                        break;
                    }

                    let data = encode(&telemetry.borrow());
                    debug!("{} notify: {} bytes", name, data.len());
                    if let Err(err) = notifier.notify(data).await {
                        warn!("{} notification error: {}", name, err);
                        break;
                    }
                }
                info!("{} notification session ended", name);
            });
        }
        .boxed()
    })
}

/// Notify session that forwards control-loop status events matching `wanted`,
/// optionally sending `initial()` first so the client knows the current state.
fn status_notify_fn(
    name: &'static str,
    notifications: broadcast::Sender<Notification>,
    initial: Option<Box<dyn Fn() -> Vec<u8> + Send + Sync>>,
    wanted: fn(&Notification) -> bool,
) -> NotifyFn {
    Box::new(move |notifier| {
        let mut statuses = notifications.subscribe();
        let first = initial.as_ref().map(|f| f());
        async move {
            tokio::spawn(async move {
                info!(
                    "{} notification session started (confirming={})",
                    name,
                    notifier.confirming()
                );
                let mut notifier = notifier;
                if let Some(first) = first {
                    if let Err(err) = notifier.notify(first).await {
                        warn!("{} notification error: {}", name, err);
                        return;
                    }
                }
                loop {
                    let notification = match statuses.recv().await {
                        Ok(n) => n,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("{} subscriber lagged, {} events dropped", name, missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if notifier.is_stopped() {
                        break;
                    }
                    if !wanted(&notification) {
                        continue;
                    }
                    if let Err(err) = notifier.notify(notification.encode()).await {
                        warn!("{} notification error: {}", name, err);
                        break;
                    }
                }
                info!("{} notification session ended", name);
            });
        }
        .boxed()
    })
}
