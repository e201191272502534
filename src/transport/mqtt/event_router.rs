//! Pure routing of rumqttc event loop output
//!
//! Translates raw v5 packets into the small set of decisions the client's
//! event loop acts on. Nothing here touches the network.

use crate::protocol::{InboundMessage, QoS};
use crate::transport::ConnectStatus;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::mqttbytes::QoS as WireQoS;
use rumqttc::v5::Event;
use rumqttc::Outgoing;

impl From<QoS> for WireQoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => WireQoS::AtMostOnce,
            QoS::AtLeastOnce => WireQoS::AtLeastOnce,
            QoS::ExactlyOnce => WireQoS::ExactlyOnce,
        }
    }
}

impl From<WireQoS> for QoS {
    fn from(qos: WireQoS) -> Self {
        match qos {
            WireQoS::AtMostOnce => QoS::AtMostOnce,
            WireQoS::AtLeastOnce => QoS::AtLeastOnce,
            WireQoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK, for the first connect or any reconnect
    ConnectionAcknowledged {
        session_present: bool,
        status: ConnectStatus,
    },
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker sent DISCONNECT
    Disconnected,
    /// SUBACK with one entry per requested filter; `None` is a rejection
    SubscriptionAcknowledged {
        packet_id: u16,
        grants: Vec<Option<QoS>>,
    },
    /// A SUBSCRIBE left the client with this packet id
    SubscribeSent { packet_id: u16 },
    /// Our own DISCONNECT left the client
    DisconnectSent,
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event with nothing to act on
    OutgoingEvent,
}

pub struct EventRouter;

impl EventRouter {
    pub fn route(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                    status: Self::connect_status(&connack.code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.clone(),
                    qos: publish.qos.into(),
                    dup: publish.dup,
                    retain: publish.retain,
                }),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    grants: suback.return_codes.iter().map(Self::grant_from).collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    pub fn connect_status(code: &ConnectReturnCode) -> ConnectStatus {
        match code {
            ConnectReturnCode::Success => ConnectStatus::Accepted,
            refused => ConnectStatus::Refused(format!("{refused:?}")),
        }
    }

    fn grant_from(code: &SubscribeReasonCode) -> Option<QoS> {
        match code {
            SubscribeReasonCode::Success(qos) => Some((*qos).into()),
            _ => None,
        }
    }
}
