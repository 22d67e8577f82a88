//! System prompt assembly for text replies.

pub const DEFAULT_SMS_PROMPT: &str = "You are Maggie, a helpful AI assistant. You are responding to an SMS text message. Reply in a friendly and concise way. Keep responses brief (1-2 sentences max). Do not reference phone calls - this is a text message conversation.";

/// Reply language configured on an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    /// Answer in whatever language the customer wrote in.
    Multi,
    French,
    Spanish,
    German,
}

impl Language {
    /// `en-US`, `multi`, `fr`, `es`, `de`; region suffixes are ignored and
    /// anything unknown is English.
    pub fn from_code(code: &str) -> Self {
        let primary = code.split(['-', '_']).next().unwrap_or_default().to_lowercase();
        match primary.as_str() {
            "multi" => Self::Multi,
            "fr" => Self::French,
            "es" => Self::Spanish,
            "de" => Self::German,
            _ => Self::English,
        }
    }

    /// Instruction placed before everything else in the prompt.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::English => "",
            Self::Multi => "LANGUAGE: Detect the language of the incoming message and respond in the SAME language. If unclear, default to English.\n\n",
            Self::French => "LANGUE: Tu DOIS répondre UNIQUEMENT en français.\nLANGUAGE: You MUST respond ONLY in French.\n\n",
            Self::Spanish => "IDIOMA: Debes responder ÚNICAMENTE en español.\nLANGUAGE: You MUST respond ONLY in Spanish.\n\n",
            Self::German => "SPRACHE: Du musst AUSSCHLIESSLICH auf Deutsch antworten.\nLANGUAGE: You MUST respond ONLY in German.\n\n",
        }
    }

    /// Texting rules appended to the prompt. `service_number` is offered to
    /// customers who ask to talk.
    pub fn sms_suffix(&self, service_number: &str, ongoing: bool) -> String {
        let (heading, rules, ongoing_rule): (&str, [String; 8], &str) = match self {
            Self::English | Self::Multi => (
                "IMPORTANT CONTEXT:",
                [
                    "You are responding via SMS TEXT MESSAGE (not a voice call)".into(),
                    "The customer is TEXTING you, not calling".into(),
                    "Keep responses BRIEF: 1-2 sentences maximum".into(),
                    "Use casual, friendly text message language".into(),
                    r#"NEVER mention: "calling", "call back", "speak", "talk", "phone call", "voice""#.into(),
                    r#"ALWAYS use text-appropriate language: "text", "message", "reply", "send""#.into(),
                    format!(r#"If they ask to talk/call, say: "I can help via text, or you can call {service_number} to speak with someone""#),
                    "This is asynchronous messaging - they may not respond immediately".into(),
                ],
                "This is an ONGOING conversation - respond naturally to continue it, do NOT give a welcome/intro message",
            ),
            Self::French => (
                "CONTEXTE IMPORTANT:",
                [
                    "Tu réponds par SMS (pas par appel vocal)".into(),
                    "Le client t'envoie un MESSAGE TEXTE, pas un appel".into(),
                    "Garde tes réponses BRÈVES: 1-2 phrases maximum".into(),
                    "Utilise un langage décontracté et amical".into(),
                    r#"Ne JAMAIS mentionner: "appeler", "rappeler", "parler", "appel téléphonique", "voix""#.into(),
                    r#"TOUJOURS utiliser un langage adapté au texte: "texto", "message", "répondre", "envoyer""#.into(),
                    format!(r#"S'ils veulent parler/appeler, dis: "Je peux vous aider par texto, ou appelez le {service_number} pour parler à quelqu'un""#),
                    "C'est une messagerie asynchrone - ils ne répondront pas forcément immédiatement".into(),
                ],
                "C'est une conversation EN COURS - réponds naturellement pour la continuer, ne donne PAS de message de bienvenue/intro",
            ),
            Self::Spanish => (
                "CONTEXTO IMPORTANTE:",
                [
                    "Estás respondiendo por SMS (no por llamada de voz)".into(),
                    "El cliente te está enviando un MENSAJE DE TEXTO, no llamando".into(),
                    "Mantén las respuestas BREVES: 1-2 oraciones máximo".into(),
                    "Usa un lenguaje casual y amigable".into(),
                    r#"NUNCA menciones: "llamar", "devolver la llamada", "hablar", "llamada telefónica", "voz""#.into(),
                    r#"SIEMPRE usa lenguaje apropiado para texto: "texto", "mensaje", "responder", "enviar""#.into(),
                    format!(r#"Si quieren hablar/llamar, di: "Puedo ayudarte por texto, o llama al {service_number} para hablar con alguien""#),
                    "Es mensajería asíncrona - puede que no respondan inmediatamente".into(),
                ],
                "Esta es una conversación EN CURSO - responde naturalmente para continuarla, NO des un mensaje de bienvenida/intro",
            ),
            Self::German => (
                "WICHTIGER KONTEXT:",
                [
                    "Du antwortest per SMS (nicht per Sprachanruf)".into(),
                    "Der Kunde schreibt dir eine TEXTNACHRICHT, ruft nicht an".into(),
                    "Halte Antworten KURZ: maximal 1-2 Sätze".into(),
                    "Verwende lockere, freundliche Sprache".into(),
                    r#"NIEMALS erwähnen: "anrufen", "zurückrufen", "sprechen", "Telefonat", "Stimme""#.into(),
                    r#"IMMER textgerechte Sprache verwenden: "SMS", "Nachricht", "antworten", "senden""#.into(),
                    format!(r#"Wenn sie anrufen möchten, sage: "Ich kann dir per SMS helfen, oder ruf {service_number} an, um mit jemandem zu sprechen""#),
                    "Dies ist asynchrone Kommunikation - sie antworten möglicherweise nicht sofort".into(),
                ],
                "Dies ist ein LAUFENDES Gespräch - antworte natürlich, um es fortzusetzen, gib KEINE Willkommens-/Intro-Nachricht",
            ),
        };

        let mut out = format!("\n\n{heading}");
        for rule in rules.iter().map(String::as_str).chain(ongoing.then_some(ongoing_rule)) {
            out.push_str("\n- ");
            out.push_str(rule);
        }
        out
    }
}

/// Knowledge-base section placed right after the base prompt.
pub fn knowledge_section(knowledge: &str) -> String {
    format!(
        "\n\nKNOWLEDGE BASE - USE THIS INFORMATION TO ANSWER QUESTIONS:\n{knowledge}\n\nIMPORTANT: Base your answers on the knowledge base information above. If the question is not covered in the knowledge base, you can provide a general helpful response, but prefer the KB content when relevant.\n"
    )
}

/// Everything that goes into an SMS reply prompt.
#[derive(Debug, Default)]
pub struct SmsPrompt<'a> {
    pub language: &'a str,
    pub system_prompt: Option<&'a str>,
    pub knowledge: Option<&'a str>,
    pub memory: Option<&'a str>,
    pub similar: Option<&'a str>,
    pub service_number: &'a str,
    pub ongoing: bool,
}

impl SmsPrompt<'_> {
    pub fn build(&self) -> String {
        let language = Language::from_code(self.language);
        let base = self
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_SMS_PROMPT);

        let mut prompt = format!("{}{base}", language.prefix());
        if let Some(kb) = self.knowledge {
            prompt.push_str(&knowledge_section(kb));
        }
        for section in [self.memory, self.similar].into_iter().flatten() {
            prompt.push_str("\n\n");
            prompt.push_str(section);
        }
        prompt.push_str(&language.sms_suffix(self.service_number, self.ongoing));
        prompt
    }
}
