use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::select;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn, Instrument, Span};

use crate::config::ProxyConfig;
use crate::connect::backoff::LinearBackoff;
use crate::connect::prober::Prober;
use crate::error::{SocketError, SocketException};
use crate::link::proxy_link::{link_to_proxy, LinkAttempt, ProxyLink};
use crate::model::address::SocketAddress;
use crate::model::name_record::{NameQuery, NameRecord, NameRecordType};
use crate::model::reference::Reference;
use crate::model::socket_info::SocketInfo;
use crate::provider::{Provider, UpsertOutcome};

/// A proxy that is considered for a link, together with the number of times it failed
///  during this connect
#[derive(Debug, Clone)]
struct Candidate {
    proxy: NameRecord,
    fault_count: u32,
}

impl Candidate {
    fn fresh(proxy: NameRecord) -> Candidate {
        Candidate { proxy, fault_count: 0 }
    }
}

/// Produces exactly one open [ProxyLink] for a socket by trying candidate proxies.
///
/// Candidates flow through stages connected by channels:
///
/// ```ascii
///  source -+-------------------------------------------> link --> winner
///          |                                            ^  |
///          +----------------------------> probe --------+  |
///                                           ^              |
///                        error/retry -------+              |
///                           ^                              |
///                           +------------------------------+
/// ```
///
/// * The source stage queries the name service. Proxies the caller bound to, or proxies that
///   linked to the host before, go to the link stage directly. All other proxies that might
///   reach the host are probed right away and linked if the probe succeeds.
/// * The link stage does one link RPC at a time, so there are never redundant remote links.
///   The first successful link wins and ends the pipeline.
/// * The error stage drops a failed proxy from the host's references, persists that, waits for
///   the candidate's backoff and resubmits it for probing. A candidate is retried until the
///   pipeline is cancelled.
/// * When the pipeline times out or is cancelled, the link stage is drained: an attempt in
///   flight sees the cancellation and closes whatever it created on the proxy.
pub struct LinkPipeline {
    socket_id: Reference,
    info: SocketInfo,
    provider: Provider,
    config: Arc<ProxyConfig>,
    prober: Arc<dyn Prober>,
}

impl LinkPipeline {
    pub fn new(socket_id: Reference, info: SocketInfo, provider: Provider, config: Arc<ProxyConfig>, prober: Arc<dyn Prober>) -> LinkPipeline {
        LinkPipeline {
            socket_id,
            info,
            provider,
            config,
            prober,
        }
    }

    /// Links to the first proxy that accepts. `bound` restricts the candidates to the proxies
    ///  matching that address. Fails with [SocketError::Connecting] if no candidate succeeded
    ///  when `timeout` expires or `ct` is cancelled; the host record is updated and persisted
    ///  on success.
    #[instrument(skip_all, fields(socket = %self.socket_id, host = %host.name))]
    pub async fn establish(&self, host: NameRecord, bound: Option<SocketAddress>, timeout: Duration, ct: &CancellationToken) -> anyhow::Result<Arc<ProxyLink>> {
        let pipeline_ct = ct.child_token();

        let (link_send, link_recv) = mpsc::unbounded_channel();
        let (probe_send, probe_recv) = mpsc::unbounded_channel();
        let (error_send, error_recv) = mpsc::unbounded_channel();
        let (host_send, host_recv) = watch::channel(host.clone());

        let mut stages = JoinSet::new();
        stages.spawn(source_stage(self.provider.clone(), host, self.info.address.clone(), bound, link_send.clone(), probe_send.clone()).instrument(Span::current()));
        stages.spawn(probe_stage(probe_recv, link_send, self.prober.clone(), self.info.address.clone(), pipeline_ct.clone()).instrument(Span::current()));
        stages.spawn(error_stage(error_recv, probe_send, host_send, self.provider.clone(), self.config.clone(), pipeline_ct.clone()).instrument(Span::current()));

        let linking = self.link_stage(link_recv, error_send, &pipeline_ct);
        tokio::pin!(linking);

        let finished = select! {
            w = &mut linking => Some(w),
            _ = tokio::time::sleep(timeout) => {
                debug!("timed out after {:?}", timeout);
                None
            }
            _ = ct.cancelled() => None,
        };

        pipeline_ct.cancel();
        let winner = match finished {
            Some(w) => w,
            None => {
                // an attempt in flight observes the cancellation and closes its remote link
                if let Some(late) = linking.await {
                    debug!("closing link through {} that completed after the deadline", late.proxy().name);
                    if let Err(e) = late.close(&CancellationToken::new()).await {
                        warn!("could not close late link through {}: {}", late.proxy().name, e);
                    }
                }
                None
            }
        };
        stages.shutdown().await;

        let link = match winner {
            Some(link) => link,
            None => return Err(SocketException::new(SocketError::Connecting, format!("no proxy linked to {}", self.info.address)).into()),
        };

        let host = host_recv.borrow().clone();
        self.on_linked(host, &link).await;
        Ok(link)
    }

    async fn link_stage(&self, mut candidates: mpsc::UnboundedReceiver<Candidate>, errors: mpsc::UnboundedSender<Candidate>, ct: &CancellationToken) -> Option<Arc<ProxyLink>> {
        loop {
            let candidate = select! {
                biased;
                _ = ct.cancelled() => return None,
                c = candidates.recv() => c?,
            };

            trace!("linking through {}", candidate.proxy.name);
            match link_to_proxy(self.socket_id, &self.info, &candidate.proxy, &self.provider, &self.config, ct).await {
                Ok(LinkAttempt::Linked(link)) => return Some(link),
                Ok(LinkAttempt::Cancelled) => return None,
                Err(e) => {
                    debug!("link through {} failed: {}", candidate.proxy.name, e);
                    let _ = errors.send(Candidate {
                        proxy: candidate.proxy,
                        fault_count: candidate.fault_count + 1,
                    });
                }
            }
        }
    }

    async fn on_linked(&self, host: NameRecord, link: &ProxyLink) {
        let now = SystemTime::now();
        let host = host
            .with_reference(link.proxy().address)
            .touched(now);
        let proxy = link.proxy().clone().touched(now);

        for record in [host, proxy] {
            let name = record.name.clone();
            if let Err(e) = self.provider.name_service.upsert(record).await {
                warn!("could not persist {} after linking: {}", name, e);
            }
        }
        info!("linked through proxy {}", link.proxy().name);
    }
}

async fn source_stage(provider: Provider, host: NameRecord, destination: SocketAddress, bound: Option<SocketAddress>, link: mpsc::UnboundedSender<Candidate>, probe: mpsc::UnboundedSender<Candidate>) {
    let name_service = &provider.name_service;

    if let Some(bound) = bound {
        let query = NameQuery::MatchesAddress { address: bound, record_type: NameRecordType::PROXY };
        for proxy in query_or_empty(name_service.query(&query).await) {
            let _ = link.send(Candidate::fresh(proxy));
        }
        return;
    }

    if !host.references.is_empty() {
        let query = NameQuery::MatchesReferences {
            references: host.references.iter().copied().collect(),
            record_type: NameRecordType::PROXY,
        };
        for proxy in query_or_empty(name_service.query(&query).await) {
            let _ = link.send(Candidate::fresh(proxy));
        }
    }

    // proxies that linked to the host before were sent to the link stage already
    let query = NameQuery::ProxyForHost { address: destination };
    for proxy in query_or_empty(name_service.query(&query).await) {
        if !host.references.contains(&proxy.address) {
            let _ = probe.send(Candidate::fresh(proxy));
        }
    }
}

fn query_or_empty(result: anyhow::Result<Vec<NameRecord>>) -> Vec<NameRecord> {
    result.unwrap_or_else(|e| {
        debug!("no candidates: {}", e);
        Vec::new()
    })
}

async fn probe_stage(mut candidates: mpsc::UnboundedReceiver<Candidate>, link: mpsc::UnboundedSender<Candidate>, prober: Arc<dyn Prober>, address: SocketAddress, ct: CancellationToken) {
    let mut probes = JoinSet::new();
    loop {
        select! {
            c = candidates.recv() => {
                let Some(candidate) = c else { break };
                let prober = prober.clone();
                let address = address.clone();
                let link = link.clone();
                let ct = ct.clone();
                probes.spawn(async move {
                    if prober.probe(&candidate.proxy, &address, &ct).await {
                        let _ = link.send(candidate);
                    }
                    else {
                        debug!("dropping candidate {} after failed probe", candidate.proxy.name);
                    }
                }.instrument(Span::current()));
            }
            Some(_) = probes.join_next(), if !probes.is_empty() => {}
            _ = ct.cancelled() => break,
        }
    }
}

async fn error_stage(mut candidates: mpsc::UnboundedReceiver<Candidate>, probe: mpsc::UnboundedSender<Candidate>, host: watch::Sender<NameRecord>, provider: Provider, config: Arc<ProxyConfig>, ct: CancellationToken) {
    let backoff = LinearBackoff::new(config.throttle_delay);
    let permits = Arc::new(Semaphore::new(config.retry_parallelism));
    let mut retries = JoinSet::new();

    loop {
        let candidate = select! {
            c = candidates.recv() => match c {
                Some(c) => c,
                None => break,
            },
            Some(_) = retries.join_next(), if !retries.is_empty() => continue,
            _ = ct.cancelled() => break,
        };

        if candidate.fault_count > 0 && host.borrow().references.contains(&candidate.proxy.address) {
            forget_reference(&host, &provider, &candidate.proxy.address).await;
        }

        let delay = backoff.delay(candidate.fault_count);
        let permits = permits.clone();
        let probe = probe.clone();
        let ct = ct.clone();
        retries.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else { return };
            trace!("retrying {} in {:?}", candidate.proxy.name, delay);
            select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = probe.send(candidate);
                }
                _ = ct.cancelled() => {}
            }
        }.instrument(Span::current()));
    }
}

async fn forget_reference(host: &watch::Sender<NameRecord>, provider: &Provider, proxy: &Reference) {
    host.send_modify(|h| {
        h.references.remove(proxy);
    });
    let updated = host.borrow().clone();

    match provider.name_service.upsert(updated).await {
        Ok(UpsertOutcome::Stored(stored)) => {
            debug!("removed proxy {} from host {}", proxy, stored.name);
            host.send_replace(stored);
        }
        Ok(UpsertOutcome::Removed) => debug!("host record was removed from the registry"),
        Err(e) => warn!("could not persist host after removing proxy {}: {}", proxy, e),
    }
}
