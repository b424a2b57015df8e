mod peer;
mod policy;
mod protocol;
mod ticket;

pub use peer::{TransportConfig, peer};
pub use policy::{JoinPolicy, MaxCollaborators, SharedPolicy};
pub use protocol::{
    ClientFrame, PresenceEntry, PresenceInput, ServerFrame, decode_blob, decode_op, encode_blob,
    encode_op,
};
pub use ticket::{IssuedTicket, TicketIssuer, TicketSubject};
