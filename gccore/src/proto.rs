//! Protobuf envelopes exchanged with the SFU and between participants.

/// Everything the SFU sends on the signalling channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SfuToParticipant {
    #[prost(oneof = "sfu_to_participant::Message", tags = "1, 2, 3, 4")]
    pub message: ::core::option::Option<sfu_to_participant::Message>,
}

pub mod sfu_to_participant {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Relay(super::OuterEnvelope),
        #[prost(message, tag = "2")]
        Hello(Hello),
        #[prost(message, tag = "3")]
        ParticipantJoined(ParticipantJoined),
        #[prost(message, tag = "4")]
        ParticipantLeft(ParticipantLeft),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Hello {
        #[prost(uint32, repeated, tag = "1")]
        pub participant_ids: ::prost::alloc::vec::Vec<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ParticipantJoined {
        #[prost(uint32, tag = "1")]
        pub participant_id: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ParticipantLeft {
        #[prost(uint32, tag = "1")]
        pub participant_id: u32,
    }
}

/// Everything a participant sends to the SFU.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantToSfu {
    #[prost(bytes = "vec", tag = "1")]
    pub padding: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "participant_to_sfu::Message", tags = "2, 3, 4, 5")]
    pub message: ::core::option::Option<participant_to_sfu::Message>,
}

pub mod participant_to_sfu {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "2")]
        Relay(super::OuterEnvelope),
        #[prost(message, tag = "3")]
        UpdateCallState(UpdateCallState),
        #[prost(message, tag = "4")]
        RequestVideo(RequestVideo),
        #[prost(message, tag = "5")]
        Leave(Leave),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UpdateCallState {
        #[prost(bytes = "vec", tag = "1")]
        pub encrypted_call_state: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RequestVideo {
        #[prost(uint32, tag = "1")]
        pub participant_id: u32,
        #[prost(bool, tag = "2")]
        pub subscribe: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Leave {}
}

/// Participant-to-participant payload as relayed by the SFU.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OuterEnvelope {
    #[prost(uint32, tag = "1")]
    pub sender: u32,
    #[prost(uint32, tag = "2")]
    pub receiver: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub encrypted_data: ::prost::alloc::vec::Vec<u8>,
}

/// Plaintext inside [`OuterEnvelope::encrypted_data`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantToParticipant {
    #[prost(bytes = "vec", tag = "1")]
    pub padding: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "participant_to_participant::Message", tags = "2, 3, 4, 5, 6")]
    pub message: ::core::option::Option<participant_to_participant::Message>,
}

pub mod participant_to_participant {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "2")]
        Hello(Hello),
        #[prost(message, tag = "3")]
        HelloAck(HelloAck),
        #[prost(message, tag = "4")]
        Rekey(Rekey),
        #[prost(message, tag = "5")]
        CaptureState(CaptureState),
        #[prost(message, tag = "6")]
        AppData(AppData),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Hello {
        #[prost(string, tag = "1")]
        pub identity: ::prost::alloc::string::String,
        #[prost(bytes = "vec", tag = "2")]
        pub public_key: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HelloAck {
        #[prost(message, optional, tag = "1")]
        pub media_key: ::core::option::Option<super::MediaKey>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Rekey {
        #[prost(message, optional, tag = "1")]
        pub media_key: ::core::option::Option<super::MediaKey>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CaptureState {
        #[prost(enumeration = "CaptureDevice", tag = "1")]
        pub device: i32,
        #[prost(bool, tag = "2")]
        pub on: bool,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum CaptureDevice {
        Microphone = 0,
        Camera = 1,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AppData {
        #[prost(bytes = "vec", tag = "1")]
        pub data: ::prost::alloc::vec::Vec<u8>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaKey {
    #[prost(uint32, tag = "1")]
    pub epoch: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: ::prost::alloc::vec::Vec<u8>,
}

/// Call state as stored (encrypted) on the SFU.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallState {
    #[prost(bytes = "vec", tag = "1")]
    pub padding: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub created_by: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub created_at: u64,
    #[prost(message, repeated, tag = "4")]
    pub participants: ::prost::alloc::vec::Vec<call_state::Participant>,
}

pub mod call_state {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Participant {
        #[prost(uint32, tag = "1")]
        pub participant_id: u32,
        #[prost(string, tag = "2")]
        pub identity: ::prost::alloc::string::String,
    }
}
