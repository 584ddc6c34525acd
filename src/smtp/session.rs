//! Per-connection SMTP state machine.
//!
//! The session never touches the socket. The server feeds it command lines
//! and body chunks and writes back whatever it answers, which keeps every
//! protocol decision testable without a network.

use super::command::{self, Command, ParseError};
use super::reply::Reply;
use crate::dispatcher::DispatchError;
use crate::gateway::Gateway;
use crate::staging::StagingBuffer;
use crate::validation::{AddressRole, Check, DnsVerdict, MessageFacts};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connected,
    Greeted,
    SenderSet,
    RecipientsSet,
    Receiving,
    Completed,
    Failed,
    Closed,
}

impl State {
    fn is_greeted(self) -> bool {
        !matches!(self, State::Connected | State::Closed)
    }

    fn in_transaction(self) -> bool {
        matches!(
            self,
            State::SenderSet | State::RecipientsSet | State::Receiving
        )
    }
}

/// What the connection should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reply(Reply),
    /// Send the reply, then read the message body.
    StartData(Reply),
    /// Send the reply, then close the connection.
    Close(Reply),
}

impl Action {
    pub fn reply(&self) -> &Reply {
        match self {
            Action::Reply(reply) | Action::StartData(reply) | Action::Close(reply) => reply,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

impl Envelope {
    fn has_recipient(&self, address: &str) -> bool {
        self.recipients.iter().any(|r| r.eq_ignore_ascii_case(address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthExchange {
    Plain,
    LoginUser,
    LoginPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFault {
    TooLarge,
    WriteFailed,
}

pub struct Session {
    id: Uuid,
    remote: SocketAddr,
    helo: Option<String>,
    envelope: Envelope,
    state: State,
    auth: Option<AuthExchange>,
    staging: Option<StagingBuffer>,
    spool_permit: Option<OwnedSemaphorePermit>,
    body_fault: Option<BodyFault>,
    /// Some envelope address of this transaction passed a DNS lookup.
    dns_checked: bool,
    gateway: Arc<Gateway>,
}

impl Session {
    pub fn new(gateway: Arc<Gateway>, remote: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            helo: None,
            envelope: Envelope::default(),
            state: State::Connected,
            auth: None,
            staging: None,
            spool_permit: None,
            body_fault: None,
            dns_checked: false,
            gateway,
        }
    }

    /// Identity of the current transaction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_receiving(&self) -> bool {
        self.state == State::Receiving
    }

    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} ESMTP mailgate", self.gateway.settings.hostname))
    }

    /// Handle one command line (line ending already removed).
    pub async fn handle_line(&mut self, line: &str) -> Action {
        if let Some(step) = self.auth.take() {
            return Action::Reply(self.continue_auth(step, line.trim()));
        }

        if self.state == State::Receiving {
            return Action::Reply(Reply::bad_sequence("5.5.1 Error: message body in progress"));
        }

        let command = match command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                log::debug!("{} Syntax error from {}: {e}", self.id, self.remote);
                return Action::Reply(match e {
                    ParseError::MissingArgument(_) => Reply::syntax_error(format!("5.5.4 Syntax: {e}")),
                    ParseError::BadPath(_) => {
                        Reply::syntax_error("5.1.3 Error: bad address syntax")
                    }
                });
            }
        };

        match command {
            Command::Helo(name) => Action::Reply(self.greet(name, false).await),
            Command::Ehlo(name) => Action::Reply(self.greet(name, true).await),
            Command::Auth { mechanism, initial } => {
                Action::Reply(self.start_auth(&mechanism, initial.as_deref()))
            }
            Command::Mail { ref from, .. } => {
                let declared_size = command.declared_size();
                Action::Reply(self.mail_from(from, declared_size).await)
            }
            Command::Rcpt { to, .. } => Action::Reply(self.rcpt_to(&to).await),
            Command::Data => self.data().await,
            Command::Rset => {
                self.reset_transaction().await;
                if self.state.is_greeted() {
                    self.state = State::Greeted;
                }
                Action::Reply(Reply::ok("2.0.0 Ok"))
            }
            Command::Noop => Action::Reply(Reply::ok("2.0.0 Ok")),
            Command::Vrfy(_) => Action::Reply(Reply::new(
                252,
                "2.5.2 Cannot VRFY user, but will accept message and attempt delivery",
            )),
            Command::Help => Action::Reply(Reply::new(214, "2.0.0 See RFC 5321")),
            Command::Quit => {
                self.reset_transaction().await;
                self.state = State::Closed;
                Action::Close(Reply::new(221, "2.0.0 Bye"))
            }
            Command::StartTls => {
                Action::Reply(Reply::new(502, "5.5.1 Error: command not implemented"))
            }
            Command::Unknown(line) => {
                log::debug!("{} Unrecognized command: {line}", self.id);
                Action::Reply(Reply::new(500, "5.5.2 Error: command not recognized"))
            }
        }
    }

    async fn greet(&mut self, name: String, extended: bool) -> Reply {
        self.reset_transaction().await;
        log::debug!("{} {} greeted as {name}", self.id, self.remote);
        self.helo = Some(name);
        self.state = State::Greeted;

        let hostname = self.gateway.settings.hostname.clone();
        if !extended {
            return Reply::ok(hostname);
        }
        Reply::multiline(
            250,
            vec![
                hostname,
                format!("SIZE {}", self.gateway.settings.max_message_size),
                "8BITMIME".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
        )
    }

    fn start_auth(&mut self, mechanism: &str, initial: Option<&str>) -> Reply {
        if !self.state.is_greeted() {
            return Reply::bad_sequence("5.5.1 Error: send HELO/EHLO first");
        }
        if self.state.in_transaction() {
            return Reply::bad_sequence("5.5.1 Error: MAIL transaction in progress");
        }

        match (mechanism, initial) {
            ("PLAIN", Some(response)) => self.continue_auth(AuthExchange::Plain, response),
            ("PLAIN", None) => {
                self.auth = Some(AuthExchange::Plain);
                Reply::new(334, "")
            }
            ("LOGIN", Some(username)) => self.continue_auth(AuthExchange::LoginUser, username),
            ("LOGIN", None) => {
                self.auth = Some(AuthExchange::LoginUser);
                Reply::new(334, "VXNlcm5hbWU6")
            }
            _ => Reply::new(504, "5.5.4 Unrecognized authentication type"),
        }
    }

    /// Credentials are never verified. The exchange only runs to completion.
    fn continue_auth(&mut self, step: AuthExchange, response: &str) -> Reply {
        if response == "*" {
            return Reply::syntax_error("5.7.0 Authentication aborted");
        }

        match step {
            AuthExchange::Plain => {
                if let Some(user) = plain_identity(response) {
                    log::debug!("{} AUTH PLAIN as {user}", self.id);
                }
                authenticated()
            }
            AuthExchange::LoginUser => {
                self.auth = Some(AuthExchange::LoginPassword);
                Reply::new(334, "UGFzc3dvcmQ6")
            }
            AuthExchange::LoginPassword => {
                log::debug!("{} AUTH LOGIN completed", self.id);
                authenticated()
            }
        }
    }

    async fn mail_from(&mut self, from: &str, declared_size: Option<usize>) -> Reply {
        if !self.state.is_greeted() {
            return Reply::bad_sequence("5.5.1 Error: send HELO/EHLO first");
        }
        if self.state.in_transaction() {
            return Reply::bad_sequence("5.5.1 Error: nested MAIL command");
        }

        let max_size = self.gateway.settings.max_message_size;
        if declared_size.is_some_and(|size| size > max_size) {
            return Reply::new(552, "5.3.4 Message size exceeds fixed maximum message size");
        }

        self.id = Uuid::new_v4();
        log::info!("{} Receiving message from <{from}> ({})", self.id, self.remote);

        if !from.is_empty() {
            let verdict = self
                .gateway
                .validator
                .check_address(from, AddressRole::Sender)
                .await;
            if let Some(reply) = self.dns_rejection(&verdict, AddressRole::Sender, from) {
                return reply;
            }
            self.dns_checked |= verdict != DnsVerdict::Disabled;
        }

        self.envelope.sender = Some(from.to_string());
        self.state = State::SenderSet;
        Reply::ok("2.1.0 Ok")
    }

    async fn rcpt_to(&mut self, to: &str) -> Reply {
        if !self.state.is_greeted() {
            return Reply::bad_sequence("5.5.1 Error: send HELO/EHLO first");
        }
        if !self.state.in_transaction() {
            return Reply::bad_sequence("5.5.1 Error: need MAIL command");
        }

        if self.envelope.has_recipient(to) {
            return Reply::ok("2.1.5 Ok");
        }
        if self.envelope.recipients.len() >= self.gateway.settings.max_recipients {
            log::warn!("{} Too many recipients, refusing <{to}>", self.id);
            return Reply::new(452, "4.5.3 Error: too many recipients");
        }

        if self.gateway.settings.reject_unknown_at_rcpt
            && !self.gateway.dispatcher.classify(to).is_accepted()
        {
            log::info!("{} Recipient <{to}> is not in a handled domain", self.id);
            return Reply::new(
                550,
                format!("5.1.1 <{to}>: Recipient address rejected: domain not handled here"),
            );
        }

        let verdict = self
            .gateway
            .validator
            .check_address(to, AddressRole::Recipient)
            .await;
        if let Some(reply) = self.dns_rejection(&verdict, AddressRole::Recipient, to) {
            return reply;
        }
        self.dns_checked |= verdict != DnsVerdict::Disabled;

        self.envelope.recipients.push(to.to_string());
        self.state = State::RecipientsSet;
        Reply::ok("2.1.5 Ok")
    }

    fn dns_rejection(&self, verdict: &DnsVerdict, role: AddressRole, address: &str) -> Option<Reply> {
        if verdict.is_accepted() {
            return None;
        }
        let (who, status) = match role {
            AddressRole::Sender => ("Sender", "1.8"),
            AddressRole::Recipient => ("Recipient", "1.2"),
        };
        log::info!("{} {who} <{address}> failed DNS check: {verdict:?}", self.id);

        Some(if verdict.is_permanent() {
            Reply::new(
                550,
                format!("5.{status} <{address}>: {who} address rejected: Domain not found"),
            )
        } else {
            Reply::new(
                450,
                format!("4.{status} <{address}>: {who} address rejected: Domain not reachable"),
            )
        })
    }

    async fn data(&mut self) -> Action {
        if !self.state.is_greeted() {
            return Action::Reply(Reply::bad_sequence("5.5.1 Error: send HELO/EHLO first"));
        }
        if self.envelope.sender.is_none() {
            return Action::Reply(Reply::bad_sequence("5.5.1 Error: need MAIL command"));
        }
        if self.envelope.recipients.is_empty() {
            return Action::Reply(Reply::bad_sequence("5.5.1 Error: need RCPT command"));
        }

        let Some(permit) = self.gateway.try_reserve_spool() else {
            log::warn!("{} All body spools in use", self.id);
            return Action::Reply(Reply::new(
                451,
                "4.3.2 Too many messages in progress, try again later",
            ));
        };

        match self.gateway.staging.allocate().await {
            Ok(buffer) => {
                log::debug!("{} Staging body at {}", self.id, buffer.path().display());
                self.staging = Some(buffer);
                self.spool_permit = Some(permit);
                self.body_fault = None;
                self.state = State::Receiving;
                Action::StartData(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
            }
            Err(e) => {
                log::error!("{} {e}", self.id);
                Action::Reply(Reply::local_error())
            }
        }
    }

    /// Append unstuffed body bytes. Errors are remembered and reported when
    /// the body ends, since the client keeps sending until then.
    pub async fn write_body(&mut self, chunk: &[u8]) {
        if self.body_fault.is_some() {
            return;
        }
        let Some(buffer) = self.staging.as_mut() else {
            return;
        };

        if buffer.len() + chunk.len() > self.gateway.settings.max_message_size {
            log::warn!(
                "{} Message exceeds {} bytes, discarding",
                self.id,
                self.gateway.settings.max_message_size
            );
            self.body_fault = Some(BodyFault::TooLarge);
            if let Some(buffer) = self.staging.take() {
                buffer.discard().await;
            }
            return;
        }

        let written = buffer.write(chunk).await;
        if let Err(e) = written {
            log::error!("{} {e}", self.id);
            self.body_fault = Some(BodyFault::WriteFailed);
            self.staging = None;
        }
    }

    /// End of the body: validate, dispatch and pick the transaction reply.
    pub async fn finish_data(&mut self) -> Reply {
        let permit = self.spool_permit.take();
        let staging = self.staging.take();
        let fault = self.body_fault.take();
        let envelope = std::mem::take(&mut self.envelope);
        let dns = if std::mem::take(&mut self.dns_checked) {
            Check::Enabled(true)
        } else {
            Check::Disabled
        };

        let reply = self.complete(staging, fault, envelope, dns).await;
        drop(permit);

        self.state = if reply.is_positive() {
            State::Completed
        } else {
            State::Failed
        };
        log::info!("{} Transaction finished: {reply}", self.id);
        reply
    }

    async fn complete(
        &self,
        staging: Option<StagingBuffer>,
        fault: Option<BodyFault>,
        envelope: Envelope,
        dns: Check<bool>,
    ) -> Reply {
        let id = self.id;
        match fault {
            Some(BodyFault::TooLarge) => {
                return Reply::new(552, "5.3.4 Error: message file too big")
            }
            Some(BodyFault::WriteFailed) => return Reply::local_error(),
            None => {}
        }

        let Some(staging) = staging else {
            log::error!("{id} Body finished without a staging buffer");
            return Reply::local_error();
        };
        let raw = match staging.consume().await {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("{id} {e}");
                return Reply::local_error();
            }
        };
        log::debug!("{id} Processing {} byte message", raw.len());

        let validator = &self.gateway.validator;
        let result = validator
            .inspect(&MessageFacts {
                sender_ip: self.remote.ip(),
                sender: envelope.sender.as_deref().unwrap_or_default(),
                helo: self.helo.as_deref().unwrap_or_default(),
                raw: &raw,
                dns,
            })
            .await;
        log::debug!(
            "{id} Validation: dkim={:?} spf={:?} spam={:?} dns={:?}",
            result.dkim,
            result.spf,
            result.spam_score,
            result.dns
        );

        if validator.rejects_as_spam(&result) {
            log::warn!("{id} Rejected as spam (score {})", result.spam_score());
            return Reply::new(550, "5.7.1 Message rejected as spam");
        }

        match self
            .gateway
            .dispatcher
            .dispatch(id, &envelope.recipients, raw)
            .await
        {
            Ok(_) => Reply::ok(format!("2.0.0 Ok: queued as {id}")),
            Err(DispatchError::Unclassified(_)) => {
                Reply::new(554, "5.1.1 Error: invalid recipient address")
            }
            Err(e @ DispatchError::Submit { .. }) => {
                log::error!("{id} {e}");
                Reply::local_error()
            }
        }
    }

    /// Drop any in-flight transaction after a transport failure.
    pub fn abort(&mut self) {
        if let Some(buffer) = self.staging.take() {
            log::debug!("{} Aborting staged body {}", self.id, buffer.key());
        }
        self.spool_permit = None;
        self.body_fault = None;
        self.dns_checked = false;
        self.auth = None;
        self.envelope = Envelope::default();
        self.state = State::Closed;
    }

    /// Give up on an idle client: drop the transaction and build the 421.
    pub fn timed_out(&mut self) -> Reply {
        log::warn!("{} Command timeout from {}", self.id, self.remote);
        self.abort();
        Reply::new(
            421,
            format!("4.4.2 {} Error: timeout exceeded", self.gateway.settings.hostname),
        )
    }

    async fn reset_transaction(&mut self) {
        if let Some(buffer) = self.staging.take() {
            buffer.discard().await;
        }
        self.spool_permit = None;
        self.body_fault = None;
        self.dns_checked = false;
        self.envelope = Envelope::default();
    }
}

fn authenticated() -> Reply {
    Reply::new(235, "2.7.0 Authentication successful")
}

/// Authentication identity from a SASL PLAIN response
/// (`authzid NUL authcid NUL passwd`).
fn plain_identity(response: &str) -> Option<String> {
    let decoded = STANDARD.decode(response).ok()?;
    let mut fields = decoded.split(|b| *b == 0);
    let _authzid = fields.next()?;
    let authcid = fields.next()?;
    String::from_utf8(authcid.to_vec()).ok()
}
