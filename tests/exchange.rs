//! Correlated request/response exchanges through a live connection: alpha
//! matching, confirmation mapping, timeouts, and cancellation.

mod common;

use cbus_pci::{
    CBusError,
    Connection,
    MemoryChannel,
    ReadCommand,
    ResponseCode,
    Value,
    WriteCommand,
    wire::{Attribute, LightingData, UnitAddress},
};
use common::{fast_config, handshake_response, spawn_scripted_pci};
use tokio_util::sync::CancellationToken;

fn correlated_alpha(frame: &str) -> Option<char> {
    frame
        .strip_prefix('\\')
        .and_then(|body| body.chars().last())
}

/// Connect against a simulator that answers every correlated request via
/// `confirm`, which receives the request frame and its alpha.
async fn connect_scripted(
    confirm: impl Fn(&str, char) -> Option<Vec<u8>> + Send + 'static,
) -> Connection {
    let (channel, handle) = MemoryChannel::new();
    spawn_scripted_pci(handle, move |frame| {
        if let Some(alpha) = correlated_alpha(frame) {
            confirm(frame, alpha)
        } else {
            handshake_response(frame)
        }
    });
    let connection = Connection::new(channel, fast_config());
    connection.connect().await.expect("setup should complete");
    connection
}

#[tokio::test]
async fn lighting_write_is_confirmed_by_its_alpha() {
    let connection =
        connect_scripted(|_, alpha| Some(format!("{alpha}.\r\n").into_bytes())).await;
    let cancel = CancellationToken::new();

    let results = connection
        .writer()
        .write(
            &cancel,
            vec![(
                "on".to_owned(),
                WriteCommand::Lighting {
                    bridges: Vec::new(),
                    command: LightingData::On { group: 8 },
                },
            )],
        )
        .await
        .unwrap();
    assert_eq!(results["on"], ResponseCode::Ok);
    connection.close().await;
}

#[tokio::test]
async fn confirmation_with_wrong_alpha_is_ignored() {
    // The simulator confirms with an alpha no request used.
    let connection = connect_scripted(|_, _| Some(b"z.\r\n".to_vec())).await;
    let cancel = CancellationToken::new();

    let results = connection
        .writer()
        .write(
            &cancel,
            vec![(
                "on".to_owned(),
                WriteCommand::Lighting {
                    bridges: Vec::new(),
                    command: LightingData::On { group: 8 },
                },
            )],
        )
        .await
        .unwrap();
    assert_eq!(results["on"], ResponseCode::RequestTimeout);
    connection.close().await;
}

#[tokio::test]
async fn failed_confirmation_maps_to_its_response_code() {
    let connection =
        connect_scripted(|_, alpha| Some(format!("{alpha}#\r\n").into_bytes())).await;
    let cancel = CancellationToken::new();

    let results = connection
        .writer()
        .write(
            &cancel,
            vec![(
                "on".to_owned(),
                WriteCommand::Lighting {
                    bridges: Vec::new(),
                    command: LightingData::On { group: 8 },
                },
            )],
        )
        .await
        .unwrap();
    assert_eq!(results["on"], ResponseCode::RemoteError);
    connection.close().await;
}

#[tokio::test]
async fn identify_read_returns_the_decoded_attribute() {
    // Confirmation plus embedded identify reply: manufacturer "CLIPSAL ".
    let connection = connect_scripted(|_, alpha| {
        Some(format!("{alpha}.8900434C495053414C20\r\n").into_bytes())
    })
    .await;
    let cancel = CancellationToken::new();

    let results = connection
        .reader()
        .read(
            &cancel,
            vec![(
                "manufacturer".to_owned(),
                ReadCommand::Identify {
                    unit: UnitAddress(4),
                    bridges: Vec::new(),
                    attribute: Attribute::Manufacturer,
                },
            )],
        )
        .await
        .unwrap();
    let result = &results["manufacturer"];
    assert_eq!(result.code, ResponseCode::Ok);
    assert_eq!(result.value, Some(Value::Str("CLIPSAL".to_owned())));
    connection.close().await;
}

#[tokio::test]
async fn confirm_only_read_reports_not_found() {
    let connection =
        connect_scripted(|_, alpha| Some(format!("{alpha}.\r\n").into_bytes())).await;
    let cancel = CancellationToken::new();

    let results = connection
        .reader()
        .read(
            &cancel,
            vec![(
                "manufacturer".to_owned(),
                ReadCommand::Identify {
                    unit: UnitAddress(4),
                    bridges: Vec::new(),
                    attribute: Attribute::Manufacturer,
                },
            )],
        )
        .await
        .unwrap();
    assert_eq!(results["manufacturer"].code, ResponseCode::NotFound);
    connection.close().await;
}

#[tokio::test]
async fn oversized_batch_is_rejected_up_front() {
    let connection =
        connect_scripted(|_, alpha| Some(format!("{alpha}.\r\n").into_bytes())).await;
    let cancel = CancellationToken::new();

    let commands: Vec<_> = (0..21)
        .map(|index| {
            (
                format!("cmd{index}"),
                ReadCommand::Identify {
                    unit: UnitAddress(4),
                    bridges: Vec::new(),
                    attribute: Attribute::Manufacturer,
                },
            )
        })
        .collect();
    assert!(matches!(
        connection.reader().read(&cancel, commands).await,
        Err(CBusError::BatchTooLarge {
            requested: 21,
            limit: 20,
        })
    ));
    connection.close().await;
}

#[tokio::test]
async fn cancelled_exchange_unwinds_without_blocking() {
    // A simulator that never confirms correlated requests.
    let connection = connect_scripted(|_, _| None).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = connection
        .reader()
        .read(
            &cancel,
            vec![(
                "never".to_owned(),
                ReadCommand::Identify {
                    unit: UnitAddress(4),
                    bridges: Vec::new(),
                    attribute: Attribute::Manufacturer,
                },
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CBusError::Cancelled));

    // The gate slot was released: a follow-up exchange still runs.
    let fresh = CancellationToken::new();
    let results = connection
        .writer()
        .write(
            &fresh,
            vec![(
                "on".to_owned(),
                WriteCommand::Lighting {
                    bridges: Vec::new(),
                    command: LightingData::On { group: 8 },
                },
            )],
        )
        .await
        .unwrap();
    assert_eq!(results["on"], ResponseCode::RequestTimeout);
    connection.close().await;
}
