//! Email integration via Mailgun.
//!
//! The rendered markdown body is converted to HTML before sending.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mailgun_rs::{EmailAddress, Mailgun, Message};
use tera::Tera;
use tracing::debug;
use url::Url;

use crate::{
	alerts::Alert,
	config::{EmailConfig, MailgunConfig},
	error::{FailureReason, NotifyError},
	notify::{Notifier, NotifyContext},
	templates::{build_context, render_message},
};

pub struct EmailNotifier {
	config: EmailConfig,
	mailgun: MailgunConfig,
	tera: Arc<Tera>,
	external_url: Option<Url>,
}

impl EmailNotifier {
	pub fn new(
		config: EmailConfig,
		mailgun: MailgunConfig,
		tera: Arc<Tera>,
		external_url: Option<Url>,
	) -> Self {
		Self {
			config,
			mailgun,
			tera,
			external_url,
		}
	}
}

#[async_trait]
impl Notifier for EmailNotifier {
	fn kind(&self) -> &'static str {
		"email"
	}

	async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
		let context = build_context(
			&ctx.group_key,
			&ctx.receiver,
			alerts,
			self.external_url.as_ref(),
			Utc::now(),
		);
		let (subject, body) = render_message(&self.tera, &context, self.config.subject.as_deref())
			.map_err(|err| {
				NotifyError::permanent(FailureReason::Other, format!("rendering email: {err:?}"))
			})?;

		let html = {
			let parser = pulldown_cmark::Parser::new(&body);
			let mut html_output = String::new();
			pulldown_cmark::html::push_html(&mut html_output, parser);
			html_output
		};

		debug!(to = ?self.config.to, subject, "sending email");

		let sender = EmailAddress::address(&self.mailgun.from);
		let mailgun = Mailgun {
			api_key: self.mailgun.api_key.clone(),
			domain: self.mailgun.domain.clone(),
		};
		let message = Message {
			to: self
				.config
				.to
				.iter()
				.map(|email| EmailAddress::address(email))
				.collect(),
			subject,
			html,
			..Default::default()
		};

		mailgun
			.async_send(mailgun_rs::MailgunRegion::US, &sender, message, None)
			.await
			.map(drop)
			.map_err(|err| NotifyError::transient(FailureReason::Other, format!("mailgun: {err}")))
	}
}
