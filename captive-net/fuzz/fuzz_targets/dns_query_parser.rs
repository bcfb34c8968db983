#![no_main]

use captive_net::dns::{answer_a, encode, read_query, Inbound};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Only panics matter here.
    match read_query(data) {
        Inbound::Query(request) => {
            let _ = encode(&answer_a(&request, std::net::Ipv4Addr::new(10, 0, 0, 1), 0));
        }
        Inbound::Reject(reply) => {
            let _ = encode(&reply);
        }
        Inbound::Drop => {}
    }
});
