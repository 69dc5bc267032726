//! The five protocol discovery engines: UPnP/SSDP, mDNS/DNS-SD,
//! WS-Discovery, MQTT, and CoAP.

pub mod coap;
pub mod mdns;
pub mod mqtt;
pub mod upnp;
pub mod wsd;
