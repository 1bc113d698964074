use rstest::rstest;

use tcp_states::sim::{Fault, Network, GATEWAY, IUT, PEER};
use tcp_states::{ErrorKind, PeerBackend, Session, SessionBuilder, SessionFlags, TcpState};

fn setup_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy)]
enum Backend {
    Socket,
    Crafted,
}

fn builder(net: &Network, backend: Backend) -> SessionBuilder {
    let iut = net.endpoint(IUT, 20000).unwrap();
    let peer = net.endpoint(PEER, 30000).unwrap();
    let backend = match backend {
        Backend::Socket => PeerBackend::Socket {
            api: net.sockets(PEER),
            injector: Some(net.rst_injector(PEER)),
        },
        Backend::Crafted => PeerBackend::Crafted {
            engine: net.packet_engine(),
        },
    };
    let builder = Session::builder(iut, net.sockets(IUT), peer, backend, net.netconf())
        .clock(net.clock());
    match net.gateway() {
        Some(gateway) => builder.gateway(gateway),
        None => builder,
    }
}

fn assert_clean(net: &Network) {
    for agent in [IUT, PEER, GATEWAY] {
        assert!(net.arp_entries(agent).is_empty(), "ARP entries left on {}", agent);
        assert!(net.routes(agent).is_empty(), "routes left on {}", agent);
        assert_eq!(net.open_fds(agent), 0, "descriptors left on {}", agent);
    }
    assert!(!net.forwarding(GATEWAY));
    assert_eq!(net.csap_count(), 0);
    assert_eq!(net.armed_injectors(), 0);
}

#[rstest]
#[case(Backend::Socket, PEER, Fault::Socket)]
#[case(Backend::Socket, PEER, Fault::Bind)]
#[case(Backend::Socket, PEER, Fault::Listen)]
#[case(Backend::Socket, PEER, Fault::ArmInjector)]
#[case(Backend::Socket, IUT, Fault::AddRoute)]
#[case(Backend::Socket, PEER, Fault::AddRoute)]
#[case(Backend::Socket, GATEWAY, Fault::SetForwarding)]
#[case(Backend::Socket, IUT, Fault::Socket)]
#[case(Backend::Socket, IUT, Fault::Bind)]
#[case(Backend::Crafted, PEER, Fault::CreateCsap)]
#[case(Backend::Crafted, IUT, Fault::Bind)]
#[case(Backend::Crafted, GATEWAY, Fault::AddArp)]
fn test_failed_open_rolls_back(
    #[case] backend: Backend,
    #[case] agent: &str,
    #[case] fault: Fault,
) {
    setup_logging();
    let net = Network::with_gateway();
    net.fail_next(agent, fault);

    let err = match builder(&net, backend).open() {
        Ok(_) => panic!("open survived {} on {}", fault, agent),
        Err(err) => err,
    };
    assert!(
        matches!(
            err.kind(),
            ErrorKind::ConfigFailed | ErrorKind::PeerSendFailed | ErrorKind::IutCallFailed
        ),
        "{}",
        err
    );
    assert_eq!(net.pending_faults(), 0);
    assert_clean(&net);
}

#[rstest]
#[case(Backend::Socket)]
#[case(Backend::Crafted)]
fn test_close_leaves_nothing_behind(#[case] backend: Backend) {
    setup_logging();
    let net = Network::with_gateway();
    let mut session = builder(&net, backend).open().unwrap();
    assert!(net.forwarding(GATEWAY));
    assert_eq!(net.routes(IUT).len(), 1);
    assert_eq!(net.routes(PEER).len(), 1);

    let outcome = session.run_str(
        TcpState::Closed,
        TcpState::Unknown,
        SessionFlags::empty(),
        "CLOSED SYN_SENT ESTABLISHED FIN_WAIT1",
    );
    assert!(outcome.is_ok(), "{}", outcome);
    assert!(!net.arp_entries(GATEWAY).is_empty());

    session.close().unwrap();
    assert_clean(&net);
}

#[test]
fn test_drop_tears_down() {
    setup_logging();
    let net = Network::direct();
    {
        let mut session = builder(&net, Backend::Crafted).open().unwrap();
        let outcome = session.run_states(
            TcpState::Unknown,
            SessionFlags::empty(),
            &[TcpState::SynSent],
        );
        assert!(outcome.is_ok(), "{}", outcome);
        assert_eq!(net.open_fds(IUT), 1);
        assert_eq!(net.csap_count(), 1);
    }
    assert_clean(&net);
}

#[test]
fn test_drop_disarms_injector() {
    setup_logging();
    let net = Network::direct();
    {
        let mut session = builder(&net, Backend::Socket).open().unwrap();
        let outcome = session.run_str(
            TcpState::Closed,
            TcpState::Unknown,
            SessionFlags::empty(),
            "CLOSED SYN_SENT ESTABLISHED",
        );
        assert!(outcome.is_ok(), "{}", outcome);
        assert!(session.iut_fd().is_some());
        assert!(session.peer_fd().is_some());
    }
    assert_clean(&net);
}

#[test]
fn test_preconfigured_gateway_is_left_alone() {
    setup_logging();
    let net = Network::with_gateway();
    let iut_ip = net.endpoint(IUT, 0).unwrap().ip();
    let peer_ip = net.endpoint(PEER, 0).unwrap().ip();
    let gateway = net.gateway().unwrap();
    net.add_route(IUT, peer_ip, gateway.iut_side.ip()).unwrap();
    net.add_route(PEER, iut_ip, gateway.peer_side.ip()).unwrap();
    net.set_forwarding(GATEWAY, true).unwrap();

    let mut session = builder(&net, Backend::Crafted)
        .gateway(gateway.preconfigured(true))
        .open()
        .unwrap();
    assert_eq!(net.routes(IUT).len(), 1);
    let outcome = session.run_states(
        TcpState::Unknown,
        SessionFlags::empty(),
        &[TcpState::SynSent, TcpState::Established],
    );
    assert!(outcome.is_ok(), "{}", outcome);
    session.close().unwrap();

    assert_eq!(net.routes(IUT).len(), 1);
    assert_eq!(net.routes(PEER).len(), 1);
    assert!(net.forwarding(GATEWAY));
}

#[test]
fn test_forwarding_already_on_stays_on() {
    setup_logging();
    let net = Network::with_gateway();
    net.set_forwarding(GATEWAY, true).unwrap();

    let session = builder(&net, Backend::Socket).open().unwrap();
    assert!(net.forwarding(GATEWAY));
    session.close().unwrap();

    assert!(net.forwarding(GATEWAY));
    assert!(net.routes(IUT).is_empty());
    assert!(net.routes(PEER).is_empty());
}

#[test]
fn test_connectivity_restored_on_close() {
    setup_logging();
    let net = Network::direct();
    let mut session = builder(&net, Backend::Socket).open().unwrap();
    let outcome = session.run_states(
        TcpState::Unknown,
        SessionFlags::empty(),
        &[TcpState::SynSent],
    );
    assert!(outcome.is_ok(), "{}", outcome);
    assert!(!net.arp_entries(IUT).is_empty() || !net.arp_entries(PEER).is_empty());

    session.close().unwrap();
    assert_clean(&net);
}
